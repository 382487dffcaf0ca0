use std::collections::HashMap;

use rmalloc::*;

struct Live {
    byte: u8,
    len: usize,
    pin: Option<core::ptr::NonNull<u8>>,
}

fn check_contents(rm: &Rmalloc<impl OomHandler>, live: &HashMap<Handle, Live>) {
    for (&h, chunk) in live {
        let bytes = rm.chunk(h).unwrap();
        assert!(bytes.len() >= chunk.len);
        assert!(bytes[..chunk.len].iter().all(|&b| b == chunk.byte), "{:?} corrupted", h);

        if let Some(ptr) = chunk.pin {
            assert_eq!(bytes.as_ptr(), ptr.as_ptr() as *const u8, "{:?} moved while pinned", h);
        }
    }
}

fn run(seed: u64, config: Config, steps: usize) {
    let rng = fastrand::Rng::with_seed(seed);
    let mut rm = Rmalloc::with_config(ErrOnOom, 1 << 16, config).unwrap();
    let mut live: HashMap<Handle, Live> = HashMap::new();
    let mut handles: Vec<Handle> = Vec::new();

    for step in 0..steps {
        match rng.u8(0..10) {
            0..=3 => {
                let len = rng.usize(1..600);
                if let Ok(h) = rm.allocate(len) {
                    let byte = rng.u8(..);
                    rm.chunk_mut(h).unwrap()[..len].fill(byte);
                    assert!(live.insert(h, Live { byte, len, pin: None }).is_none());
                    handles.push(h);
                }
            }
            4 | 5 if !handles.is_empty() => {
                let h = handles.swap_remove(rng.usize(..handles.len()));
                live.remove(&h);
                rm.try_free(h).unwrap();
            }
            6 if !handles.is_empty() => {
                let h = handles[rng.usize(..handles.len())];
                let ptr = if rng.bool() { rm.try_lock(h) } else { rm.try_weak_lock(h) }.unwrap();
                live.get_mut(&h).unwrap().pin = Some(ptr);
            }
            7 if !handles.is_empty() => {
                let h = handles[rng.usize(..handles.len())];
                rm.try_unlock(h).unwrap();
                live.get_mut(&h).unwrap().pin = None;
            }
            8 => {
                let clock = ManualClock::stepping(1);
                let budget = rng.u64(0..4);
                let high = rm.memory_high();
                let report = rm.compact_with(budget, &clock);
                assert_eq!(report.reclaimed, high - rm.memory_high());
                if budget == 0 {
                    assert!(report.completed);
                }
            }
            _ => {}
        }

        if let Err(violation) = rm.verify() {
            panic!("seed {} step {}: {}\n{}", seed, step, violation, rm.layout_map());
        }
        check_contents(&rm, &live);
        assert_eq!(rm.live_chunk_count(), live.len());
    }

    // unpin everything and compact fully: only live bytes remain below the high-water mark
    for (&h, chunk) in live.iter_mut() {
        rm.unlock(h);
        chunk.pin = None;
    }
    rm.compact_with(0, &ManualClock::new());
    check_contents(&rm, &live);

    let live_bytes: usize = rm.live_chunks().map(|span| span.size()).sum();
    assert_eq!(rm.memory_high(), live_bytes);
    assert_eq!(rm.total_free_bytes(), 0);
}

#[test]
fn random_actions_reuse_first() {
    for seed in 0..24 {
        run(seed, Config::new(), 600);
    }
}

#[test]
fn random_actions_bump_first() {
    for seed in 100..116 {
        run(seed, Config::new().with_placement(Placement::BumpFirst), 600);
    }
}

#[test]
fn random_actions_poisoned() {
    for seed in 200..208 {
        run(seed, Config::new().with_poison(0xa5), 400);
    }
}
