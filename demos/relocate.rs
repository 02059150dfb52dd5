use core::alloc::Layout;
use core::ptr;

use offset_allocator::{Arena, OffsetPtr};

#[repr(C)]
struct Word {
    len: usize,
    bytes: [u8; 16],
    next: OffsetPtr<Word>,
}

fn print_words(label: &str, arena: &Arena) {
    let mut word = arena.base().cast::<Word>().as_ptr();
    print!("{} ({:p}):", label, word);
    while !word.is_null() {
        unsafe {
            let text = core::str::from_utf8(&(&(*word).bytes)[..(*word).len]).unwrap_or("?");
            print!(" {}", text);
            word = (*word).next.resolve();
        }
    }
    println!();
}

fn main() {
    env_logger::init();

    let arena = Arena::new(1024).expect("could not create arena");
    let words = ["offset", "pointers", "survive", "relocation"];

    let mut previous: *mut Word = ptr::null_mut();
    for text in words.iter() {
        let word = arena
            .allocate(Layout::new::<Word>())
            .expect("arena exhausted")
            .cast::<Word>()
            .as_ptr();
        let mut bytes = [0u8; 16];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        unsafe {
            ptr::addr_of_mut!((*word).len).write(text.len());
            ptr::addr_of_mut!((*word).bytes).write(bytes);
            OffsetPtr::write(ptr::addr_of_mut!((*word).next), ptr::null_mut());
            if let Some(previous) = previous.as_mut() {
                previous.next.set(word);
            }
        }
        previous = word;
    }

    print_words("original", &arena);
    let moved = arena.relocated().expect("could not relocate arena");
    drop(arena);
    print_words("relocated", &moved);
}
