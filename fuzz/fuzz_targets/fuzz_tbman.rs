#![no_main]

use std::ptr;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use tbman::{Grant, SyncTbman, TbmanConfig};

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate `size` bytes (size 0 is skipped).
    Alloc { size: u16 },
    /// Free the ith live grant through the hintless path.
    Free { index: u8 },
    /// Free the ith live grant with its granted size as the hint.
    FreeHinted { index: u8 },
    /// Realloc the ith live grant to `new_size`.
    Realloc { index: u8, new_size: u16 },
}
use Actions::*;

fuzz_target!(|actions: Vec<Actions>| {
    let man = SyncTbman::new(&TbmanConfig::default());

    let mut grants: Vec<Grant> = vec![];

    for action in actions {
        match action {
            Alloc { size } => {
                if size == 0 {
                    continue;
                }

                let grant = unsafe { man.alloc(ptr::null_mut(), size as usize) };
                assert!(grant.size >= size as usize);
                unsafe { grant.ptr.write_bytes(0xab, size as usize) };
                grants.push(grant);
            }
            Free { index } => {
                if index as usize >= grants.len() {
                    continue;
                }

                let grant = grants.swap_remove(index as usize);
                unsafe { man.alloc(grant.ptr, 0) };
            }
            FreeHinted { index } => {
                if index as usize >= grants.len() {
                    continue;
                }

                let grant = grants.swap_remove(index as usize);
                unsafe { man.nalloc(grant.ptr, grant.size, 0) };
            }
            Realloc { index, new_size } => {
                if index as usize >= grants.len() {
                    continue;
                }
                if new_size == 0 {
                    continue;
                }

                let old = grants[index as usize];
                let grant = unsafe { man.alloc(old.ptr, new_size as usize) };
                assert!(grant.size >= new_size as usize);
                if old.size < new_size as usize {
                    unsafe {
                        grant
                            .ptr
                            .add(old.size)
                            .write_bytes(0xcd, new_size as usize - old.size);
                    }
                }
                grants[index as usize] = grant;
            }
        }
    }

    let granted: usize = grants.iter().map(|grant| grant.size).sum();
    assert_eq!(man.total_granted_space(), granted);
    assert_eq!(man.total_instances(), grants.len());

    // Drain whatever is left.
    for grant in grants {
        unsafe { man.alloc(grant.ptr, 0) };
    }
    assert_eq!(man.total_instances(), 0);
});
