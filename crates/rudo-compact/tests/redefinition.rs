//! Migration of instances to new klass versions during a full collection.

use rudo_compact::redefine::update_fields;
use rudo_compact::{
    collect_full, FullCollector, FullGcConfig, Heap, HeapAddr, HeapConfig, KlassDef, KlassId, RegionKind, RootHandle,
};

fn record_v1() -> KlassDef {
    KlassDef::instance("Record")
        .field("a", 8)
        .field("b", 4)
        .field("c", 4)
        .field("d", 8)
}

fn record_v2() -> KlassDef {
    KlassDef::instance("Record")
        .field("a", 8)
        .field("c", 4)
        .field("d", 8)
        .field("e", 8)
}

fn fill_pattern(heap: &Heap, obj: HeapAddr, len: usize) -> Vec<u8> {
    let bytes: Vec<u8> = (0..len).map(|i| i as u8 + 1).collect();
    heap.write_bytes(obj, 0, &bytes);
    bytes
}

fn assert_migrated_record(heap: &Heap, obj: HeapAddr, old: &[u8]) {
    let new = heap.read_bytes(obj, 0, 28);
    assert_eq!(new[0..8], old[0..8], "a");
    assert_eq!(new[8..20], old[12..24], "c and d");
    assert_eq!(new[20..28], [0; 8], "e");
}

#[test]
fn test_update_fields_remaps_by_name() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let v1 = heap.register_klass(&record_v1(), None).unwrap();
    let obj = heap.allocate(v1, 0).unwrap();
    assert_eq!(heap.object_size(obj), 4);
    let old = fill_pattern(&heap, obj, 24);

    let v2 = heap.redefine_klass(v1, &record_v2()).unwrap();
    let dest = heap.region_at(2).bottom();
    update_fields(&heap, obj, dest);

    assert_eq!(heap.klass_of(dest).id(), v2);
    assert_eq!(heap.object_size(dest), 5);
    assert_migrated_record(&heap, dest, &old);
    assert_eq!(heap.read_bytes(dest, 28, 4), [0; 4]);
}

#[test]
fn test_full_collection_migrates_instances() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let v1 = heap.register_klass(&record_v1(), None).unwrap();
    let _dead = heap.allocate(v1, 0).unwrap();
    let obj = heap.allocate(v1, 0).unwrap();
    let old = fill_pattern(&heap, obj, 24);
    let root = heap.add_root(Some(obj));

    let v2 = heap.redefine_klass(v1, &record_v2()).unwrap();
    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    let obj = heap.root(root).unwrap();
    assert_eq!(obj, 0);
    assert_eq!(heap.klass_of(obj).id(), v2);
    assert_migrated_record(&heap, obj, &old);
    assert_eq!(heap.used_words(), 5);

    assert_eq!(metrics.classes_redefined, 1);
    assert!(heap.klasses().try_get(v1).is_none());
    assert_eq!(heap.klasses().get(v2).old_version(), None);
    assert!(!heap.klasses().has_pending_redefinition());
}

#[test]
fn test_growing_instances_are_rescued() {
    let mut heap = Heap::new(HeapConfig::new(64, 8)).unwrap();
    let v1 = heap.register_klass(&KlassDef::instance("Cell").field("x", 8), None).unwrap();
    let mut roots = Vec::new();
    for i in 0..40u64 {
        let obj = heap.allocate(v1, 0).unwrap();
        heap.write_bytes(obj, 0, &i.to_le_bytes());
        roots.push(heap.add_root(Some(obj)));
    }
    let v2 = heap
        .redefine_klass(v1, &KlassDef::instance("Cell").field("x", 8).field("y", 8))
        .unwrap();

    let mut collector = FullCollector::new(&mut heap, &FullGcConfig::with_workers(1));
    collector.prepare_collection();
    assert!(collector.is_redefining());
    collector.phase1_mark_live_objects();
    collector.phase2_prepare_compaction();
    let rescued = collector.rescued_objects(0);
    assert!(!rescued.is_empty());
    assert!(rescued.windows(2).all(|w| w[0] < w[1]));
    collector.phase3_adjust_pointers();
    collector.phase4_do_compaction();
    let metrics = collector.complete_collection();

    assert_eq!(metrics.rescued_objects, rescued.len());
    assert_eq!(metrics.objects_marked, 40);
    let mut addrs = Vec::new();
    for (i, &root) in roots.iter().enumerate() {
        let obj = heap.root(root).unwrap();
        assert_eq!(heap.klass_of(obj).id(), v2);
        assert_eq!(heap.object_size(obj), 3);
        assert_eq!(heap.read_bytes(obj, 0, 8), (i as u64).to_le_bytes());
        assert_eq!(heap.read_bytes(obj, 8, 8), [0; 8]);
        addrs.push(obj);
    }
    addrs.sort_unstable();
    assert!(addrs.windows(2).all(|w| w[1] - w[0] >= 3));
    assert_eq!(heap.used_words(), 120);
}

#[test]
fn test_identical_layout_only_switches_klass() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let def = KlassDef::instance("Same").field("x", 8).reference_field("next");
    let v1 = heap.register_klass(&def, None).unwrap();
    let a = heap.allocate(v1, 0).unwrap();
    let b = heap.allocate(v1, 0).unwrap();
    heap.write_bytes(a, 0, &5u64.to_le_bytes());
    heap.store_oop(heap.field_addr(a, "next").unwrap(), Some(b));
    let root = heap.add_root(Some(a));

    let v2 = heap.redefine_klass(v1, &def).unwrap();
    assert!(heap.klasses().get(v2).update_information().is_none());
    collect_full(&mut heap, &FullGcConfig::with_workers(1));

    let a = heap.root(root).unwrap();
    assert_eq!(heap.klass_of(a).id(), v2);
    assert_eq!(heap.read_bytes(a, 0, 8), 5u64.to_le_bytes());
    let b = heap.load_oop(heap.field_addr(a, "next").unwrap()).unwrap();
    assert_eq!(heap.klass_of(b).id(), v2);
}

#[test]
fn test_reference_field_survives_migration() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = heap
        .register_klass(&KlassDef::instance("Leaf").field("v", 8), None)
        .unwrap();
    let v1 = heap
        .register_klass(&KlassDef::instance("Holder").reference_field("child").field("n", 8), None)
        .unwrap();

    let _dead = heap.allocate(leaf, 0).unwrap();
    let holder = heap.allocate(v1, 0).unwrap();
    let child = heap.allocate(leaf, 0).unwrap();
    heap.write_bytes(child, 0, &42u64.to_le_bytes());
    heap.write_bytes(holder, 8, &7u64.to_le_bytes());
    heap.store_oop(heap.field_addr(holder, "child").unwrap(), Some(child));
    let root = heap.add_root(Some(holder));

    let v2 = heap
        .redefine_klass(
            v1,
            &KlassDef::instance("Holder")
                .field("extra", 8)
                .reference_field("child")
                .field("n", 8),
        )
        .unwrap();

    for _ in 0..2 {
        collect_full(&mut heap, &FullGcConfig::with_workers(2));
        let holder = heap.root(root).unwrap();
        assert_eq!(heap.klass_of(holder).id(), v2);
        assert_eq!(heap.read_bytes(holder, 0, 8), [0; 8]);
        assert_eq!(heap.read_bytes(holder, 16, 8), 7u64.to_le_bytes());
        let child = heap.load_oop(heap.field_addr(holder, "child").unwrap()).unwrap();
        assert_eq!(heap.klass_of(child).id(), leaf);
        assert_eq!(heap.read_bytes(child, 0, 8), 42u64.to_le_bytes());
    }
    assert_eq!(heap.used_words(), 4 + 2);
}

#[test]
fn test_pinned_instance_keeps_old_version_linked() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let v1 = heap.register_klass(&KlassDef::instance("Pinned").field("x", 8), None).unwrap();
    let pinned = heap.allocate_in_region(0, v1, 0).unwrap();
    heap.write_bytes(pinned, 0, &3u64.to_le_bytes());
    heap.set_region_pinned(0, true);
    let moving = heap.allocate_in_region(1, v1, 0).unwrap();
    let pinned_root = heap.add_root(Some(pinned));
    let moving_root = heap.add_root(Some(moving));

    let v2: KlassId = heap
        .redefine_klass(v1, &KlassDef::instance("Pinned").field("x", 8).field("y", 8))
        .unwrap();
    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(metrics.classes_redefined, 0);
    assert_eq!(heap.root(pinned_root), Some(pinned));
    assert_eq!(heap.klass_of(pinned).id(), v1);
    assert_eq!(heap.read_bytes(pinned, 0, 8), 3u64.to_le_bytes());
    assert!(heap.klasses().try_get(v1).is_some());
    assert_eq!(heap.klasses().get(v2).old_version(), Some(v1));

    let moving = heap.root(moving_root).unwrap();
    assert_eq!(heap.klass_of(moving).id(), v2);
}

/// Fills regions `0..regions` of an old generation with two-word cells
/// holding their index, each one rooted.
fn old_cells(heap: &mut Heap, regions: usize) -> (KlassId, Vec<RootHandle>) {
    let v1 = heap.register_klass(&KlassDef::instance("Cell").field("v", 8), None).unwrap();
    let roots = (0..regions * 32)
        .map(|i| {
            let obj = heap.allocate_old(v1, 0).unwrap();
            heap.write_bytes(obj, 0, &(i as u64).to_le_bytes());
            heap.add_root(Some(obj))
        })
        .collect();
    (v1, roots)
}

fn wide_cell() -> KlassDef {
    KlassDef::instance("Cell").field("v", 8).field("w", 8).field("z", 8)
}

#[test]
fn test_rescued_objects_spill_into_spare_regions() {
    let mut heap = Heap::new(HeapConfig::new(64, 8)).unwrap();
    let (v1, roots) = old_cells(&mut heap, 4);
    assert_eq!(heap.free_regions(), 4);
    let v2 = heap.redefine_klass(v1, &wide_cell()).unwrap();

    let mut config = FullGcConfig::with_workers(2);
    config.set_verify(true);
    let metrics = collect_full(&mut heap, &config);

    // Every other cell of a region would overrun its unread neighbour.
    assert_eq!(metrics.rescued_objects, 64);
    assert_eq!(metrics.objects_marked, 128);
    assert_eq!(heap.used_words(), 512);
    assert_eq!(heap.free_regions(), 0);
    for (i, &root) in roots.iter().enumerate() {
        let obj = heap.root(root).unwrap();
        assert_eq!(heap.klass_of(obj).id(), v2);
        assert_eq!(heap.object_size(obj), 4);
        assert_eq!(heap.read_bytes(obj, 0, 8), (i as u64).to_le_bytes());
        assert_eq!(heap.read_bytes(obj, 8, 16), [0; 16]);
    }
    assert!(heap.klasses().try_get(v1).is_none());
}

#[test]
#[should_panic(expected = "out of free regions")]
fn test_running_out_of_spare_regions_is_fatal() {
    let mut heap = Heap::new(HeapConfig::new(64, 5)).unwrap();
    let (v1, _roots) = old_cells(&mut heap, 4);
    heap.redefine_klass(v1, &wide_cell()).unwrap();

    collect_full(&mut heap, &FullGcConfig::with_workers(1));
}

/// An instance klass with `count` eight-byte fields named `{prefix}{i}`.
fn many_fields(def: KlassDef, prefix: &str, count: usize) -> KlassDef {
    (0..count).fold(def, |def, i| def.field(&format!("{prefix}{i}"), 8))
}

fn fill_big(heap: &Heap, obj: HeapAddr) {
    for i in 0..40u64 {
        heap.write_bytes(obj, i as usize * 8, &(i * 7 + 1).to_le_bytes());
    }
}

#[test]
fn test_humongous_instance_is_migrated_when_moved() {
    let mut heap = Heap::new(HeapConfig::new(64, 6)).unwrap();
    let cell = heap.register_klass(&KlassDef::instance("Cell").field("v", 8), None).unwrap();
    let v1 = heap
        .register_klass(&many_fields(KlassDef::instance("Big"), "f", 40), None)
        .unwrap();
    let _dead = heap.allocate(cell, 0).unwrap();
    let big = heap.allocate(v1, 0).unwrap();
    assert_eq!(big, 64);
    assert_eq!(heap.region_at(1).kind(), RegionKind::StartsHumongous);
    fill_big(&heap, big);
    let root = heap.add_root(Some(big));

    // Drop f0, keep f1..f39, append one field.
    let v2_def = (1..40).fold(KlassDef::instance("Big"), |def, i| def.field(&format!("f{i}"), 8));
    let v2 = heap.redefine_klass(v1, &v2_def.field("extra", 8)).unwrap();

    let mut config = FullGcConfig::with_workers(1);
    config.set_verify(true);
    let metrics = collect_full(&mut heap, &config);

    assert_eq!(metrics.humongous_relocated, 1);
    assert_eq!(metrics.classes_redefined, 1);
    let big = heap.root(root).unwrap();
    assert_eq!(big, 0);
    assert_eq!(heap.klass_of(big).id(), v2);
    assert_eq!(heap.object_size(big), 41);
    for i in 1..40u64 {
        assert_eq!(heap.read_bytes(big, (i as usize - 1) * 8, 8), (i * 7 + 1).to_le_bytes());
    }
    assert_eq!(heap.read_bytes(big, 39 * 8, 8), [0; 8]);
    assert_eq!(heap.region_at(0).kind(), RegionKind::StartsHumongous);
    assert!(heap.region_at(1).is_free());
    assert!(heap.klasses().try_get(v1).is_none());
}

#[test]
fn test_humongous_instance_grows_in_place() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let v1 = heap
        .register_klass(&many_fields(KlassDef::instance("Big"), "f", 40), None)
        .unwrap();
    let big = heap.allocate(v1, 0).unwrap();
    assert_eq!(big, 0);
    fill_big(&heap, big);
    let root = heap.add_root(Some(big));

    let v2_def = many_fields(many_fields(KlassDef::instance("Big"), "f", 40), "g", 30);
    let v2 = heap.redefine_klass(v1, &v2_def).unwrap();

    let mut config = FullGcConfig::with_workers(1);
    config.set_verify(true);
    let metrics = collect_full(&mut heap, &config);

    assert_eq!(metrics.humongous_relocated, 1);
    assert_eq!(heap.root(root), Some(0));
    assert_eq!(heap.klass_of(0).id(), v2);
    assert_eq!(heap.object_size(0), 71);
    for i in 0..40u64 {
        assert_eq!(heap.read_bytes(0, i as usize * 8, 8), (i * 7 + 1).to_le_bytes());
    }
    assert_eq!(heap.read_bytes(0, 40 * 8, 30 * 8), vec![0; 30 * 8]);
    assert_eq!(heap.region_at(1).kind(), RegionKind::ContinuesHumongous);
    assert_eq!(heap.region_at(1).humongous_start(), 0);
    assert!(heap.klasses().try_get(v1).is_none());
}

#[test]
#[should_panic(expected = "out of free regions migrating humongous")]
fn test_humongous_instance_without_room_to_grow_is_fatal() {
    let mut heap = Heap::new(HeapConfig::new(64, 2)).unwrap();
    let v1 = heap
        .register_klass(&many_fields(KlassDef::instance("Big"), "f", 40), None)
        .unwrap();
    let big = heap.allocate(v1, 0).unwrap();
    heap.add_root(Some(big));
    heap.set_region_pinned(1, true);
    heap.redefine_klass(v1, &many_fields(many_fields(KlassDef::instance("Big"), "f", 40), "g", 30))
        .unwrap();

    collect_full(&mut heap, &FullGcConfig::with_workers(1));
}
