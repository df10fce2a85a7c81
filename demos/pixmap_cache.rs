//! An example program that uses an offscreen allocator as a pixmap cache,
//! the way a display driver would: pixmaps are uploaded to offscreen memory
//! as they're drawn, get kicked back out to system memory under pressure, and
//! everything is swapped out and back in on a VT switch.
//!
//! Run with `RUST_LOG=debug` to watch each allocation and eviction.

use std::sync::Arc;

use offscreen_alloc::{Area, AreaId, OffscreenAllocator, PoolDescriptor};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng};
use spin::Mutex;

// 8 MiB of video memory
const MEMORY_SIZE: usize = 8 << 20;
// A 1024x768 32bpp framebuffer sits at the start
const FRAMEBUFFER_SIZE: usize = 1024 * 768 * 4;
// Pixmap pitches are aligned to this
const PITCH_ALIGN: usize = 32;
// Number of distinct pixmaps
const PIXMAPS: usize = 256;
// Number of draw operations
const DRAWS: usize = 16 * 1024;

#[derive(Copy, Clone)]
struct Pixmap {
    width: usize,
    height: usize,
    // Scratch surfaces are locked while in use
    scratch: bool,
}

impl Pixmap {
    fn pitch(&self) -> usize {
        let pitch = self.width * 4;
        (pitch + PITCH_ALIGN - 1) / PITCH_ALIGN * PITCH_ALIGN
    }

    fn size(&self) -> usize {
        self.pitch() * self.height
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [DRAWS] [SEED]", args[0]);
        return;
    }
    let draws: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(DRAWS);
    let seed: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let side = Uniform::new_inclusive(8usize, 512);
    let pixmaps: Vec<Pixmap> = (0..PIXMAPS)
        .map(|_| Pixmap {
            width: side.sample(&mut rng),
            height: side.sample(&mut rng),
            scratch: rng.gen_bool(0.02),
        })
        .collect();

    let pool = PoolDescriptor::new(MEMORY_SIZE, FRAMEBUFFER_SIZE);
    let mut offscreen: OffscreenAllocator<usize> =
        OffscreenAllocator::init(pool).expect("Video memory is smaller than the framebuffer");

    // Which pixmaps live in offscreen memory, and where.
    let resident: Arc<Mutex<Vec<Option<AreaId>>>> = Arc::new(Mutex::new(vec![None; PIXMAPS]));

    let mut uploads = 0;
    let mut hits = 0;
    let mut evictions = 0;
    let mut misses = 0;
    let pick = Uniform::new(0, PIXMAPS);

    for draw in 0..draws {
        // Favour a small working set, with the odd outlier.
        let index = if rng.gen_bool(0.8) {
            pick.sample(&mut rng) % 32
        } else {
            pick.sample(&mut rng)
        };
        let pixmap = pixmaps[index];

        if resident.lock()[index].is_some() {
            hits += 1;
        } else {
            let resident_for_save = Arc::clone(&resident);
            let save = move |area: &Area<usize>| {
                if let Some(&evicted) = area.owner_data() {
                    // A real driver would copy the pixels back to system
                    // memory here.
                    resident_for_save.lock()[evicted] = None;
                }
            };

            let before = resident.lock().iter().flatten().count();
            match offscreen.alloc(
                pixmap.size(),
                PITCH_ALIGN,
                pixmap.scratch,
                Some(Box::new(save)),
                index,
            ) {
                Ok(id) => {
                    uploads += 1;
                    let mut resident = resident.lock();
                    evictions += before - resident.iter().flatten().count();
                    resident[index] = Some(id);
                }
                Err(e) => {
                    log::info!("Pixmap {} stays in system memory: {}", index, e);
                    misses += 1;
                }
            }
        }

        // Scratch pixmaps are released once drawn.
        if pixmap.scratch {
            if let Some(id) = resident.lock()[index].take() {
                offscreen.free(id).expect("Scratch pixmap was evicted");
            }
        }

        if draw % 4096 == 4095 {
            log::info!("VT switch after {} draws", draw + 1);
            offscreen.swap_out();
            assert!(resident.lock().iter().all(|r| r.is_none()));
            offscreen.swap_in();
        }
    }

    let (validity, stats) = offscreen.stats();
    assert!(validity.is_valid(), "{:?}", validity);

    println!(
        "{} draws: {} hits, {} uploads, {} evictions, {} left in system memory",
        draws, hits, uploads, evictions, misses
    );
    println!(
        "{} areas, {} bytes in use, {} bytes free, largest free area {} bytes",
        stats.length, stats.used_size, stats.available_size, stats.largest_available
    );
}
