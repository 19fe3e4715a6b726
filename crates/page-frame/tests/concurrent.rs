#![cfg(test)]

use std::{collections::HashSet, sync::Mutex, thread};

use page_frame::{PAGE_SIZE, PageAllocator, PhysAddr};

#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

fn with_allocator<F>(pages: usize, test_fn: F)
where
    F: FnOnce(&PageAllocator),
{
    let mut ram = (0..pages)
        .map(|_| Page([0; PAGE_SIZE]))
        .collect::<Vec<_>>();
    let start = PhysAddr::from_ptr(ram.as_mut_ptr());
    let end = start.checked_add_pages(pages).unwrap();
    let allocator = unsafe { PageAllocator::new(start, end) }.unwrap();
    test_fn(&allocator);
    drop(allocator);
    drop(ram);
}

#[test]
fn concurrent_allocate_share_release() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    with_allocator(64, |allocator| {
        let initial = allocator.stats();

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let mut held = Vec::new();
                    for round in 0..ROUNDS {
                        if let Some(pa) = allocator.allocate() {
                            allocator.share(pa);
                            assert_eq!(allocator.ref_count(pa).unwrap(), 2);
                            held.push(pa);
                        }
                        if round % 3 == 0 {
                            for pa in held.drain(..) {
                                allocator.release(pa);
                                allocator.release(pa);
                            }
                        }
                    }
                    for pa in held {
                        allocator.release(pa);
                        allocator.release(pa);
                    }
                });
            }
        });

        assert_eq!(allocator.stats(), initial);
    });
}

#[test]
fn concurrent_pages_are_never_handed_out_twice() {
    const THREADS: usize = 4;

    with_allocator(257, |allocator| {
        let free = allocator.stats().free_pages;
        let taken = Mutex::new(Vec::new());

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let mut mine = Vec::new();
                    while let Some(pa) = allocator.allocate() {
                        mine.push(pa);
                    }
                    taken.lock().unwrap().extend(mine);
                });
            }
        });

        let taken = taken.into_inner().unwrap();
        assert_eq!(taken.len(), free);
        let unique = taken.iter().copied().collect::<HashSet<_>>();
        assert_eq!(unique.len(), free);
        assert_eq!(allocator.stats().free_pages, 0);

        for pa in taken {
            allocator.release(pa);
        }
        assert_eq!(allocator.stats().free_pages, free);
    });
}

#[test]
fn shared_page_released_from_every_owner() {
    const OWNERS: usize = 16;

    with_allocator(8, |allocator| {
        let free = allocator.stats().free_pages;
        let pa = allocator.allocate().unwrap();
        for _ in 1..OWNERS {
            allocator.share(pa);
        }
        assert_eq!(allocator.ref_count(pa).unwrap(), 16);

        thread::scope(|s| {
            for _ in 0..OWNERS {
                s.spawn(|| allocator.release(pa));
            }
        });

        assert_eq!(allocator.ref_count(pa).unwrap(), 0);
        assert_eq!(allocator.stats().free_pages, free);
    });
}
