//! Soft, weak and phantom references, weak roots, the pending list and
//! class unloading across full collections.

use rudo_compact::{collect_full, FullGcConfig, Heap, HeapConfig, KlassDef, KlassId, ReferenceType};

fn leaf(heap: &mut Heap) -> KlassId {
    heap.register_klass(&KlassDef::instance("Leaf").field("v", 8), None)
        .unwrap()
}

fn reference_klass(heap: &mut Heap, ty: ReferenceType) -> KlassId {
    heap.register_klass(&KlassDef::reference(&format!("{ty:?}Reference"), ty), None)
        .unwrap()
}

fn referent(heap: &Heap, reference: usize) -> Option<usize> {
    heap.load_oop(heap.field_addr(reference, "referent").unwrap())
}

#[test]
fn test_weak_reference_cleared_only_when_referent_dies() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let weak = reference_klass(&mut heap, ReferenceType::Weak);

    let _garbage = heap.allocate(leaf, 0).unwrap();
    let dying_ref = heap.allocate(weak, 0).unwrap();
    let dying = heap.allocate(leaf, 0).unwrap();
    let kept_ref = heap.allocate(weak, 0).unwrap();
    let kept = heap.allocate(leaf, 0).unwrap();
    heap.store_oop(heap.field_addr(dying_ref, "referent").unwrap(), Some(dying));
    heap.store_oop(heap.field_addr(kept_ref, "referent").unwrap(), Some(kept));
    heap.write_bytes(kept, 0, &5u64.to_le_bytes());
    let r_dying = heap.add_root(Some(dying_ref));
    let r_kept = heap.add_root(Some(kept_ref));
    let r_leaf = heap.add_root(Some(kept));

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(2));

    assert_eq!(metrics.references_cleared, 1);
    assert_eq!(metrics.objects_marked, 3);
    let dying_ref = heap.root(r_dying).unwrap();
    let kept_ref = heap.root(r_kept).unwrap();
    assert_eq!(referent(&heap, dying_ref), None);
    assert_eq!(referent(&heap, kept_ref), heap.root(r_leaf));
    assert_eq!(heap.read_bytes(heap.root(r_leaf).unwrap(), 0, 8), 5u64.to_le_bytes());
    assert_eq!(heap.pending_references(), vec![dying_ref]);
}

#[test]
fn test_soft_reference_kept_unless_cleared() {
    for clear in [false, true] {
        let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
        let leaf = leaf(&mut heap);
        let soft = reference_klass(&mut heap, ReferenceType::Soft);
        let reference = heap.allocate(soft, 0).unwrap();
        let softly = heap.allocate(leaf, 0).unwrap();
        heap.write_bytes(softly, 0, &9u64.to_le_bytes());
        heap.store_oop(heap.field_addr(reference, "referent").unwrap(), Some(softly));
        let root = heap.add_root(Some(reference));

        let mut config = FullGcConfig::with_workers(1);
        config.set_clear_soft_refs(clear);
        let metrics = collect_full(&mut heap, &config);

        let reference = heap.root(root).unwrap();
        if clear {
            assert_eq!(metrics.references_cleared, 1);
            assert_eq!(referent(&heap, reference), None);
            assert_eq!(heap.used_words(), 2);
        } else {
            assert_eq!(metrics.references_cleared, 0);
            let softly = referent(&heap, reference).unwrap();
            assert_eq!(heap.read_bytes(softly, 0, 8), 9u64.to_le_bytes());
            assert!(heap.pending_references().is_empty());
        }
    }
}

#[test]
fn test_phantom_reference_cleared() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let phantom = reference_klass(&mut heap, ReferenceType::Phantom);
    let reference = heap.allocate(phantom, 0).unwrap();
    let target = heap.allocate(leaf, 0).unwrap();
    heap.store_oop(heap.field_addr(reference, "referent").unwrap(), Some(target));
    let root = heap.add_root(Some(reference));

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(metrics.references_cleared, 1);
    assert_eq!(referent(&heap, heap.root(root).unwrap()), None);
    assert_eq!(heap.pending_references(), vec![heap.root(root).unwrap()]);
}

#[test]
fn test_pending_list_keeps_references_alive_until_drained() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let weak = reference_klass(&mut heap, ReferenceType::Weak);
    let _garbage = heap.allocate(leaf, 0).unwrap();
    let reference = heap.allocate(weak, 0).unwrap();
    let target = heap.allocate(leaf, 0).unwrap();
    heap.store_oop(heap.field_addr(reference, "referent").unwrap(), Some(target));
    let root = heap.add_root(Some(reference));

    collect_full(&mut heap, &FullGcConfig::with_workers(1));
    heap.set_root(root, None);
    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(metrics.objects_marked, 1);
    let pending = heap.pending_references();
    assert_eq!(pending, vec![0]);
    assert_eq!(heap.klass_of(pending[0]).id(), weak);

    assert_eq!(heap.take_pending_references(), vec![0]);
    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));
    assert_eq!(metrics.objects_marked, 0);
    assert_eq!(heap.used_words(), 0);
}

#[test]
fn test_weak_roots_cleared_or_adjusted() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let dead = heap.allocate(leaf, 0).unwrap();
    let live = heap.allocate(leaf, 0).unwrap();
    let weak_dead = heap.add_weak_root(Some(dead));
    let weak_live = heap.add_weak_root(Some(live));
    let strong = heap.add_root(Some(live));

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(metrics.weak_roots_cleared, 1);
    assert_eq!(heap.weak_root(weak_dead), None);
    assert_eq!(heap.weak_root(weak_live), heap.root(strong));
    assert_eq!(heap.root(strong), Some(0));
}

#[test]
fn test_klass_with_dead_holder_is_unloaded() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let holder = heap.allocate(leaf, 0).unwrap();
    let plugin = heap
        .register_klass(&KlassDef::instance("Plugin").field("x", 8), Some(holder))
        .unwrap();
    heap.allocate(plugin, 0).unwrap();

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(1));

    assert_eq!(metrics.classes_unloaded, 1);
    assert!(heap.klasses().try_get(plugin).is_none());
    assert!(heap.klasses().try_get(leaf).is_some());
    assert_eq!(heap.used_words(), 0);
}

#[test]
fn test_klass_holders_are_roots_without_class_unloading() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let _garbage = heap.allocate(leaf, 0).unwrap();
    let holder = heap.allocate(leaf, 0).unwrap();
    heap.write_bytes(holder, 0, &17u64.to_le_bytes());
    let plugin = heap
        .register_klass(&KlassDef::instance("Plugin").field("x", 8), Some(holder))
        .unwrap();

    let mut config = FullGcConfig::with_workers(1);
    config.set_class_unloading(false);
    let metrics = collect_full(&mut heap, &config);

    assert_eq!(metrics.classes_unloaded, 0);
    let holder = heap.klasses().get(plugin).holder().unwrap();
    assert_eq!(holder, 0);
    assert_eq!(heap.read_bytes(holder, 0, 8), 17u64.to_le_bytes());
}

#[test]
fn test_live_instance_keeps_its_klass_loaded() {
    let mut heap = Heap::new(HeapConfig::new(64, 4)).unwrap();
    let leaf = leaf(&mut heap);
    let _garbage = heap.allocate(leaf, 0).unwrap();
    let holder = heap.allocate(leaf, 0).unwrap();
    let plugin = heap
        .register_klass(&KlassDef::instance("Plugin").field("x", 8), Some(holder))
        .unwrap();
    let instance = heap.allocate(plugin, 0).unwrap();
    heap.write_bytes(instance, 0, &23u64.to_le_bytes());
    let root = heap.add_root(Some(instance));

    let metrics = collect_full(&mut heap, &FullGcConfig::with_workers(2));

    assert_eq!(metrics.classes_unloaded, 0);
    assert_eq!(metrics.objects_marked, 2);
    let instance = heap.root(root).unwrap();
    assert_eq!(heap.klass_of(instance).id(), plugin);
    assert_eq!(heap.read_bytes(instance, 0, 8), 23u64.to_le_bytes());
    assert_eq!(heap.klasses().get(plugin).holder(), Some(0));
}
