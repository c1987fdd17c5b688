//! A parallel, region-based mark-compact full collector.
//!
//! `rudo-compact` manages a heap of fixed-size regions holding objects
//! described by registered klasses, and reclaims it with a stop-the-world
//! full collection in four parallel phases:
//!
//! 1. **Mark** everything reachable from the roots, with work stealing
//!    between workers, then process soft/weak/phantom references, weak
//!    roots and class unloading.
//! 2. **Prepare**: every worker claims regions and computes a forwarding
//!    address for each live object by sliding it towards the bottom of its
//!    compaction queue.
//! 3. **Adjust** every reference (roots and object fields) to the forwarding
//!    address of its target.
//! 4. **Compact**: move the objects, then run the serial and humongous
//!    relocation steps.
//!
//! When some klass has a pending redefinition, the collection also migrates
//! every instance to the new layout. Instances that grow and would overwrite
//! data not yet moved are copied aside and replayed once compaction is done.
//!
//! # Quick Start
//!
//! ```
//! use rudo_compact::{collect_full, FullGcConfig, Heap, HeapConfig, KlassDef};
//!
//! let mut heap = Heap::new(HeapConfig::new(1024, 8)).unwrap();
//! let node = heap
//!     .register_klass(&KlassDef::instance("Node").reference_field("next").field("value", 8), None)
//!     .unwrap();
//!
//! let a = heap.allocate(node, 0).unwrap();
//! let _garbage = heap.allocate(node, 0).unwrap();
//! let b = heap.allocate(node, 0).unwrap();
//! heap.store_oop(heap.field_addr(a, "next").unwrap(), Some(b));
//! let root = heap.add_root(Some(a));
//!
//! let metrics = collect_full(&mut heap, &FullGcConfig::default());
//! assert_eq!(metrics.objects_marked, 2);
//!
//! let a = heap.root(root).unwrap();
//! let b = heap.load_oop(heap.field_addr(a, "next").unwrap()).unwrap();
//! assert_eq!(b, a + 3);
//! ```
//!
//! # Class Redefinition
//!
//! ```
//! use rudo_compact::{collect_full, FullGcConfig, Heap, HeapConfig, KlassDef};
//!
//! let mut heap = Heap::new(HeapConfig::new(1024, 8)).unwrap();
//! let v1 = heap.register_klass(&KlassDef::instance("Point").field("x", 8), None).unwrap();
//! let p = heap.allocate(v1, 0).unwrap();
//! heap.write_bytes(p, 0, &7u64.to_le_bytes());
//! let root = heap.add_root(Some(p));
//!
//! let v2 = heap
//!     .redefine_klass(v1, &KlassDef::instance("Point").field("x", 8).field("y", 8))
//!     .unwrap();
//! collect_full(&mut heap, &FullGcConfig::default());
//!
//! let p = heap.root(root).unwrap();
//! assert_eq!(heap.klass_of(p).id(), v2);
//! assert_eq!(heap.read_bytes(p, 0, 8), 7u64.to_le_bytes());
//! assert_eq!(heap.read_bytes(p, 8, 8), [0; 8]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
pub mod gc;
mod heap;
pub mod metrics;
mod object;
pub mod redefine;
mod region;
mod roots;
pub mod tracing;

pub use config::{available_parallelism, FullGcConfig, HeapConfig};
pub use error::HeapError;
pub use gc::{
    calc_active_workers, collect_full, free_non_overlapping_regions, FullCollector, HumongousMove, MarkBitmap,
};
pub use heap::{decode_oop, encode_oop, Heap};
pub use metrics::FullGcMetrics;
pub use object::{
    decode_header, encode_header, FieldInfo, HeapAddr, Klass, KlassDef, KlassId, KlassKind, KlassTable,
    MarkWord, ReferenceType,
};
pub use region::{Generation, HeapRegion, HeapRegionClaimer, RegionKind};
pub use roots::{DerivedHandle, DerivedRoot, RootHandle, RootSet, WeakHandle};
