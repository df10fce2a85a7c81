//! An offscreen video memory allocator.
//!
//! Graphics devices usually have more memory than the visible framebuffer
//! needs. The rest, the offscreen memory, is handy for caching pixmaps and
//! other rendering surfaces. This crate manages it: areas are handed out with
//! an alignment, and when no free area is large enough, the run of areas that
//! is cheapest to lose is kicked out, after telling each owner.
//!
//! ```
//! use offscreen_alloc::{Area, OffscreenAllocator, PoolDescriptor};
//!
//! // 1 MiB of video memory, the first 768 KiB of which is the framebuffer.
//! let pool = PoolDescriptor::new(1 << 20, 768 << 10);
//! let mut offscreen: OffscreenAllocator<u32> = OffscreenAllocator::init(pool).unwrap();
//!
//! // Called if the area is ever kicked out to make room for something else.
//! let save = |area: &Area<u32>| println!("saving pixmap {:?}", area.owner_data());
//! let id = offscreen.alloc(4096, 64, false, Some(Box::new(save)), 7).unwrap();
//! assert_eq!(offscreen.area(id).unwrap().offset() % 64, 0);
//!
//! offscreen.free(id).unwrap();
//! assert_eq!(offscreen.available_count(), 1);
//! ```
//!
//! See [`OffscreenAllocator`](offscreen/struct.OffscreenAllocator.html) for
//! the details.

pub mod area;
pub mod arealist;
pub mod error;
pub mod offscreen;
pub mod shared;

pub use area::{Area, AreaId, AreaState, SaveArea, SaveBox};
pub use arealist::{AreaList, Stats, Validity};
pub use error::AllocError;
pub use offscreen::{OffscreenAllocator, PoolDescriptor};
pub use shared::SharedOffscreen;
