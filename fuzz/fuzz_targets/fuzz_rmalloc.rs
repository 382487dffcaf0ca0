#![no_main]

use rmalloc::*;

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate a chunk of the given size
    Alloc { size: u16 },
    /// Free the ith allocation
    Free { index: u8 },
    /// Lock the ith allocation
    Lock { index: u8 },
    /// Weakly lock the ith allocation
    WeakLock { index: u8 },
    /// Unlock the ith allocation
    Unlock { index: u8 },
    /// Compact for a number of clock ticks, zero meaning unbounded
    Compact { budget: u8 },
}
use Actions::*;

fuzz_target!(|input: (bool, Vec<Actions>)| {
    let (bump_first, actions) = input;
    let placement = if bump_first { Placement::BumpFirst } else { Placement::ReuseFirst };
    let config = Config::new().with_placement(placement).with_poison(0xfe);

    let mut rm = Rmalloc::with_config(ErrOnOom, 1 << 18, config).unwrap();

    // handle, fill byte, requested size, pinned address
    let mut allocations: Vec<(Handle, u8, usize, Option<core::ptr::NonNull<u8>>)> = vec![];

    for (i, action) in actions.into_iter().enumerate() {
        match action {
            Alloc { size } => {
                let size = size as usize;
                if let Ok(h) = rm.allocate(size) {
                    let byte = i as u8;
                    rm.chunk_mut(h).unwrap()[..size].fill(byte);
                    allocations.push((h, byte, size, None));
                }
            }
            Free { index } => {
                if index as usize >= allocations.len() { continue; }

                let (h, ..) = allocations.swap_remove(index as usize);
                rm.try_free(h).unwrap();
            }
            Lock { index } | WeakLock { index } => {
                if index as usize >= allocations.len() { continue; }

                let entry = &mut allocations[index as usize];
                let ptr = if matches!(action, Lock { .. }) {
                    rm.try_lock(entry.0)
                } else {
                    rm.try_weak_lock(entry.0)
                };
                let ptr = ptr.unwrap();

                if let Some(pinned) = entry.3 {
                    assert_eq!(pinned, ptr);
                }
                entry.3 = Some(ptr);
            }
            Unlock { index } => {
                if index as usize >= allocations.len() { continue; }

                let entry = &mut allocations[index as usize];
                rm.try_unlock(entry.0).unwrap();
                entry.3 = None;
            }
            Compact { budget } => {
                let report = rm.compact_with(budget as u64, &ManualClock::stepping(1));
                assert!(budget != 0 || report.completed);
            }
        }

        rm.verify().unwrap();

        for &(h, byte, size, pinned) in &allocations {
            let chunk = rm.chunk(h).unwrap();
            assert!(chunk[..size].iter().all(|&b| b == byte));
            if let Some(ptr) = pinned {
                assert_eq!(chunk.as_ptr(), ptr.as_ptr() as *const u8);
            }
        }
    }

    let counters = *rm.get_counters();
    assert_eq!(counters.allocation_count, allocations.len());
});
