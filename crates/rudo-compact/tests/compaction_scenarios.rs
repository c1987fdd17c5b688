//! End-to-end compaction scenarios.
//!
//! These tests build small heaps by hand, run full collections and check
//! where the survivors ended up and that their contents and identities
//! survived the move.

use rudo_compact::{collect_full, FullCollector, FullGcConfig, Heap, HeapAddr, HeapConfig, KlassDef, KlassId, MarkWord};

fn read_u64(heap: &Heap, obj: HeapAddr, offset: usize) -> u64 {
    let bytes = heap.read_bytes(obj, offset, 8);
    u64::from_le_bytes(bytes.try_into().unwrap())
}

fn node_klass(heap: &mut Heap) -> KlassId {
    heap.register_klass(&KlassDef::instance("Node").reference_field("next").field("value", 8), None)
        .unwrap()
}

#[test]
fn test_live_objects_slide_to_region_bottom() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let two = heap.register_klass(&KlassDef::instance("Two").field("a", 8), None).unwrap();
    let three = heap
        .register_klass(&KlassDef::instance("Three").field("a", 8).field("b", 8), None)
        .unwrap();
    let one = heap.register_klass(&KlassDef::instance("One"), None).unwrap();

    let a = heap.allocate(two, 0).unwrap();
    let _gap1 = heap.allocate(three, 0).unwrap();
    let b = heap.allocate(three, 0).unwrap();
    let _gap2 = heap.allocate(two, 0).unwrap();
    let c = heap.allocate(one, 0).unwrap();
    heap.write_bytes(a, 0, &11u64.to_le_bytes());
    heap.write_bytes(b, 0, &22u64.to_le_bytes());
    heap.write_bytes(b, 8, &33u64.to_le_bytes());
    let ra = heap.add_root(Some(a));
    let rb = heap.add_root(Some(b));
    let rc = heap.add_root(Some(c));

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(metrics.objects_marked, 3);
    assert_eq!(heap.root(ra), Some(0));
    assert_eq!(heap.root(rb), Some(2));
    assert_eq!(heap.root(rc), Some(5));
    assert_eq!(heap.region_at(0).top(), 6);
    assert_eq!(heap.object_starts(0), vec![0, 2, 5]);
    assert_eq!(read_u64(&heap, 0, 0), 11);
    assert_eq!(read_u64(&heap, 2, 0), 22);
    assert_eq!(read_u64(&heap, 2, 8), 33);
    assert_eq!(heap.klass_of(5).id(), one);
    assert_eq!(metrics.used_words_after, 6);
    assert_eq!(metrics.words_reclaimed(), 5);
}

#[test]
fn test_all_live_heap_falls_back_to_serial_compaction() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let array = heap.register_klass(&KlassDef::object_array("Object[]"), None).unwrap();

    let mut arrays = Vec::new();
    for region in 0..4 {
        arrays.push(heap.allocate_in_region(region, array, 30).unwrap());
        arrays.push(heap.allocate_in_region(region, array, 30).unwrap());
    }
    for (i, &obj) in arrays.iter().enumerate() {
        heap.store_oop(heap.element_addr(obj, 0), Some(arrays[(i + 1) % arrays.len()]));
        heap.store_oop(heap.element_addr(obj, 1), Some(arrays[(i + 2) % arrays.len()]));
    }
    let root = heap.add_root(Some(arrays[0]));

    let mut collector = FullCollector::new(&mut heap, &FullGcConfig::with_workers(2));
    collector.prepare_collection();
    collector.phase1_mark_live_objects();
    collector.phase2_prepare_compaction();
    assert!(!collector.serial_queue().is_empty());
    collector.phase3_adjust_pointers();
    collector.phase4_do_compaction();
    let metrics = collector.complete_collection();

    assert!(metrics.serial_compaction);
    assert_eq!(metrics.objects_marked, 8);
    assert_eq!(metrics.used_words_after, 4 * 64);

    let next = |obj: HeapAddr, slot: usize| heap.load_oop(heap.element_addr(obj, slot)).unwrap();
    let mut seen = Vec::new();
    let mut cur = heap.root(root).unwrap();
    for _ in 0..8 {
        assert_eq!(heap.array_length(cur), 30);
        assert_eq!(next(cur, 1), next(next(cur, 0), 0));
        seen.push(cur);
        cur = next(cur, 0);
    }
    assert_eq!(Some(cur), heap.root(root));
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 8);
}

#[test]
fn test_fragmented_heap_without_free_region_compacts_serially() {
    let mut heap = Heap::new(HeapConfig::new(64, 2)).unwrap();
    let array = heap.register_klass(&KlassDef::type_array("long[]"), None).unwrap();

    // Each region: 16 dead words followed by three live 16-word arrays.
    let mut live = Vec::new();
    for region in 0..2 {
        heap.allocate_in_region(region, array, 14).unwrap();
        for _ in 0..3 {
            let obj = heap.allocate_in_region(region, array, 14).unwrap();
            heap.store_word(obj + 2, live.len() as u64);
            live.push(heap.add_root(Some(obj)));
        }
    }

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert!(metrics.serial_compaction);
    assert_eq!(metrics.regions_freed, 0);
    assert_eq!(heap.used_words(), 6 * 16);
    for (i, &root) in live.iter().enumerate() {
        let obj = heap.root(root).unwrap();
        assert_eq!(obj, i * 16);
        assert_eq!(heap.load_word(obj + 2), i as u64);
    }
}

#[test]
fn test_identity_hash_and_lock_survive_moves() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let node = node_klass(&mut heap);

    let _dead = heap.allocate(node, 0).unwrap();
    let hashed = heap.allocate(node, 0).unwrap();
    let locked = heap.allocate(node, 0).unwrap();
    let hash = heap.identity_hash(hashed).unwrap();
    heap.lock(locked, 77);
    let rh = heap.add_root(Some(hashed));
    let rl = heap.add_root(Some(locked));

    collect_full(&mut heap, &FullGcConfig::with_workers(2));

    let hashed = heap.root(rh).unwrap();
    let locked = heap.root(rl).unwrap();
    assert_eq!(hashed, 0);
    assert_eq!(heap.identity_hash(hashed), Some(hash));
    assert_eq!(heap.mark_word(locked), MarkWord::Locked(77));
    heap.unlock(locked);
    assert_eq!(heap.mark_word(locked), MarkWord::INITIAL);
}

#[test]
fn test_derived_root_follows_its_base() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let node = node_klass(&mut heap);
    let _dead = heap.allocate(node, 0).unwrap();
    let obj = heap.allocate(node, 0).unwrap();
    let base = heap.add_root(Some(obj));
    let derived = heap.add_derived_root(base, obj + 2);

    collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(heap.root(base), Some(0));
    assert_eq!(heap.derived_root(derived), Some(2));
}

#[test]
fn test_unreachable_heap_is_emptied() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let node = node_klass(&mut heap);
    for _ in 0..60 {
        heap.allocate(node, 0).unwrap();
    }
    let used_regions = 4 - heap.free_regions();

    let metrics = collect_full(&mut heap, &FullGcConfig::default());

    assert_eq!(metrics.objects_marked, 0);
    assert_eq!(heap.used_words(), 0);
    assert_eq!(heap.free_regions(), 4);
    assert_eq!(metrics.regions_freed, used_regions);
}

#[test]
fn test_many_lists_survive_repeated_parallel_collections() {
    let mut heap = Heap::new(HeapConfig::new(256, 32)).unwrap();
    let node = node_klass(&mut heap);
    let array = heap.register_klass(&KlassDef::object_array("Node[]"), None).unwrap();

    let mut kept = Vec::new();
    let mut head: Option<HeapAddr> = None;
    for i in 0..1500u64 {
        let obj = if i % 7 == 0 {
            heap.allocate_old(node, 0).unwrap()
        } else {
            heap.allocate(node, 0).unwrap()
        };
        heap.write_bytes(obj, 8, &i.to_le_bytes());
        if i % 3 != 0 {
            heap.store_oop(heap.field_addr(obj, "next").unwrap(), head);
            head = Some(obj);
            kept.push(i);
        }
    }
    let list = heap.add_root(head);

    let every_fifth: Vec<_> = {
        let mut out = Vec::new();
        let mut cur = head;
        while let Some(obj) = cur {
            if read_u64(&heap, obj, 8) % 5 == 0 {
                out.push(obj);
            }
            cur = heap.load_oop(heap.field_addr(obj, "next").unwrap());
        }
        out
    };
    let index = heap.allocate(array, every_fifth.len()).unwrap();
    for (i, &obj) in every_fifth.iter().enumerate() {
        heap.store_oop(heap.element_addr(index, i), Some(obj));
    }
    let index_root = heap.add_root(Some(index));

    let mut config = FullGcConfig::with_workers(4);
    config.set_verify(true);
    for round in 1..=2 {
        let metrics = collect_full(&mut heap, &config);
        assert_eq!(metrics.total_collections, round);
        assert_eq!(metrics.objects_marked, kept.len() + 1);

        let mut cur = heap.root(list);
        let mut seen = Vec::new();
        while let Some(obj) = cur {
            seen.push(read_u64(&heap, obj, 8));
            cur = heap.load_oop(heap.field_addr(obj, "next").unwrap());
        }
        seen.reverse();
        assert_eq!(seen, kept);

        let index = heap.root(index_root).unwrap();
        assert_eq!(heap.array_length(index), every_fifth.len());
        for i in 0..every_fifth.len() {
            let obj = heap.load_oop(heap.element_addr(index, i)).unwrap();
            assert_eq!(read_u64(&heap, obj, 8) % 5, 0);
        }
    }
    assert_eq!(heap.used_words(), kept.len() * 3 + 2 + every_fifth.len());
}
