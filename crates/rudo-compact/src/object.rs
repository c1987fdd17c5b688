//! Object headers, mark words and klass descriptors.
//!
//! Every object starts with a single header word. The upper 24 bits hold
//! the klass id and the lower 40 bits hold the [`MarkWord`]. The klass id
//! survives forwarding, so the size of an object is computable at every
//! point of a collection, including while its mark word carries a
//! forwarding address.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::HeapError;
use crate::redefine::CopyProgram;

/// Address of a heap word, as an index from the start of the heap.
pub type HeapAddr = usize;

const KLASS_SHIFT: u32 = 40;
const MARK_MASK: u64 = (1 << KLASS_SHIFT) - 1;
const MARK_TAG_BITS: u32 = 2;
const MARK_TAG_MASK: u64 = (1 << MARK_TAG_BITS) - 1;

const TAG_DEFAULT: u64 = 0;
const TAG_LOCKED: u64 = 1;
const TAG_FORWARDED: u64 = 2;

/// Largest value a mark word can carry in its payload.
pub const MAX_MARK_VALUE: u64 = (1 << (KLASS_SHIFT - MARK_TAG_BITS)) - 1;

/// Largest klass id that fits in a header.
pub const MAX_KLASS_ID: u32 = (1 << (64 - KLASS_SHIFT)) - 1;

/// The mark half of an object header.
///
/// During a full collection the mark doubles as the forwarding record. A
/// mark that carries a hash or lock state is stashed in the preserved marks
/// before it can be overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkWord {
    /// Unlocked. `hash == 0` means no identity hash was installed.
    Default {
        /// Identity hash, or 0.
        hash: u64,
    },
    /// Holds opaque lock state.
    Locked(u64),
    /// The object has been assigned a new address.
    Forwarded(HeapAddr),
}

impl MarkWord {
    /// The mark every freshly allocated or freshly moved object gets.
    pub const INITIAL: Self = Self::Default { hash: 0 };

    /// Packs the mark into the lower 40 bits of a header.
    #[must_use]
    pub const fn encode(self) -> u64 {
        let (tag, value) = match self {
            Self::Default { hash } => (TAG_DEFAULT, hash),
            Self::Locked(state) => (TAG_LOCKED, state),
            Self::Forwarded(addr) => (TAG_FORWARDED, addr as u64),
        };
        debug_assert!(value <= MAX_MARK_VALUE);
        (value << MARK_TAG_BITS) | tag
    }

    /// Unpacks the lower 40 bits of a header.
    ///
    /// # Panics
    ///
    /// Panics on a tag no mark word is ever written with.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(bits: u64) -> Self {
        let bits = bits & MARK_MASK;
        let value = bits >> MARK_TAG_BITS;
        match bits & MARK_TAG_MASK {
            TAG_DEFAULT => Self::Default { hash: value },
            TAG_LOCKED => Self::Locked(value),
            TAG_FORWARDED => Self::Forwarded(value as HeapAddr),
            _ => panic!("corrupt mark word"),
        }
    }

    /// Returns `true` if this mark is a forwarding record.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        matches!(self, Self::Forwarded(_))
    }

    /// Returns the forwarding address, if any.
    #[must_use]
    pub const fn forwardee(self) -> Option<HeapAddr> {
        match self {
            Self::Forwarded(addr) => Some(addr),
            _ => None,
        }
    }

    /// Returns `true` if resetting this mark to [`MarkWord::INITIAL`] would
    /// lose information.
    #[must_use]
    pub const fn must_be_preserved(self) -> bool {
        match self {
            Self::Default { hash } => hash != 0,
            Self::Locked(_) => true,
            Self::Forwarded(_) => false,
        }
    }
}

/// Identifier of a registered klass. Id 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KlassId(pub(crate) u32);

impl KlassId {
    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Builds a header word.
#[must_use]
pub const fn encode_header(klass: KlassId, mark: MarkWord) -> u64 {
    ((klass.0 as u64) << KLASS_SHIFT) | mark.encode()
}

/// Splits a header word into its klass id and mark.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn decode_header(word: u64) -> (KlassId, MarkWord) {
    (
        KlassId((word >> KLASS_SHIFT) as u32),
        MarkWord::decode(word),
    )
}

/// Replaces the mark bits of a header, keeping its klass.
#[must_use]
pub const fn with_mark(word: u64, mark: MarkWord) -> u64 {
    (word & !MARK_MASK) | mark.encode()
}

/// Strength of a reference object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    /// Kept alive unless the collection clears soft references.
    Soft,
    /// Cleared as soon as the referent is otherwise unreachable.
    Weak,
    /// Cleared when the referent is otherwise unreachable; never read back.
    Phantom,
}

/// Shape of the objects a klass describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlassKind {
    /// Fixed-size object with named fields.
    Instance,
    /// Instance whose first field is a referent the collector treats weakly.
    Reference(ReferenceType),
    /// Header, length word, then `length` reference slots.
    ObjArray,
    /// Header, length word, then `length` raw words.
    TypeArray,
}

impl KlassKind {
    /// Returns `true` for array kinds.
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::ObjArray | Self::TypeArray)
    }
}

/// A laid-out field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name; fields are matched across redefinitions by name.
    pub name: String,
    /// Byte offset into the payload (the words after the header).
    pub offset: usize,
    /// Size in bytes.
    pub size: usize,
    /// Reference fields hold a heap slot and are always 8-byte aligned.
    pub is_reference: bool,
}

#[derive(Debug, Clone)]
struct FieldDef {
    name: String,
    size: usize,
    is_reference: bool,
}

/// Description of a klass to register.
///
/// Primitive fields are packed in declaration order; reference fields are
/// aligned to 8 bytes.
///
/// ```
/// use rudo_compact::KlassDef;
///
/// let point = KlassDef::instance("Point").field("x", 4).field("y", 4);
/// let node = KlassDef::instance("Node").reference_field("next").field("value", 8);
/// # let _ = (point, node);
/// ```
#[derive(Debug, Clone)]
pub struct KlassDef {
    name: String,
    kind: KlassKind,
    fields: Vec<FieldDef>,
}

impl KlassDef {
    fn new(name: &str, kind: KlassKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            fields: Vec::new(),
        }
    }

    /// A plain instance klass.
    #[must_use]
    pub fn instance(name: &str) -> Self {
        Self::new(name, KlassKind::Instance)
    }

    /// A reference klass. The `referent` field is added first.
    #[must_use]
    pub fn reference(name: &str, ty: ReferenceType) -> Self {
        Self::new(name, KlassKind::Reference(ty)).reference_field("referent")
    }

    /// An array of references.
    #[must_use]
    pub fn object_array(name: &str) -> Self {
        Self::new(name, KlassKind::ObjArray)
    }

    /// An array of raw words.
    #[must_use]
    pub fn type_array(name: &str) -> Self {
        Self::new(name, KlassKind::TypeArray)
    }

    /// Appends a primitive field of `size` bytes (1, 2, 4 or 8).
    #[must_use]
    pub fn field(mut self, name: &str, size: usize) -> Self {
        self.fields.push(FieldDef {
            name: name.to_owned(),
            size,
            is_reference: false,
        });
        self
    }

    /// Appends a reference field.
    #[must_use]
    pub fn reference_field(mut self, name: &str) -> Self {
        self.fields.push(FieldDef {
            name: name.to_owned(),
            size: 8,
            is_reference: true,
        });
        self
    }

    /// Returns the klass name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self) -> Result<(Vec<FieldInfo>, usize), HeapError> {
        if self.kind.is_array() && !self.fields.is_empty() {
            return Err(HeapError::InvalidKlass(format!(
                "array klass {} cannot declare fields",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut offset: usize = 0;
        for def in &self.fields {
            if !matches!(def.size, 1 | 2 | 4 | 8) {
                return Err(HeapError::InvalidKlass(format!(
                    "field {}.{} has unsupported size {}",
                    self.name, def.name, def.size
                )));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(HeapError::InvalidKlass(format!(
                    "duplicate field {}.{}",
                    self.name, def.name
                )));
            }
            if def.is_reference {
                offset = offset.next_multiple_of(8);
            }
            fields.push(FieldInfo {
                name: def.name.clone(),
                offset,
                size: def.size,
                is_reference: def.is_reference,
            });
            offset += def.size;
        }
        Ok((fields, offset))
    }
}

/// A registered klass.
#[derive(Debug)]
pub struct Klass {
    id: KlassId,
    name: String,
    kind: KlassKind,
    fields: Vec<FieldInfo>,
    payload_bytes: usize,
    instance_words: usize,
    oop_offsets: Vec<usize>,
    holder: Option<AtomicU64>,
    pub(crate) new_version: Option<KlassId>,
    pub(crate) old_version: Option<KlassId>,
    pub(crate) update_information: Option<CopyProgram>,
}

impl Klass {
    fn from_def(id: KlassId, def: &KlassDef, holder: Option<HeapAddr>) -> Result<Self, HeapError> {
        let (fields, payload_bytes) = def.layout()?;
        let oop_offsets = fields
            .iter()
            .filter(|f| f.is_reference)
            .map(|f| 1 + f.offset / 8)
            .collect();
        Ok(Self {
            id,
            name: def.name.clone(),
            kind: def.kind,
            fields,
            payload_bytes,
            instance_words: 1 + payload_bytes.div_ceil(8),
            oop_offsets,
            holder: holder.map(|addr| AtomicU64::new(crate::heap::encode_oop(Some(addr)))),
            new_version: None,
            old_version: None,
            update_information: None,
        })
    }

    /// Returns the klass id.
    #[must_use]
    pub const fn id(&self) -> KlassId {
        self.id
    }

    /// Returns the klass name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the klass kind.
    #[must_use]
    pub const fn kind(&self) -> KlassKind {
        self.kind
    }

    /// Returns the laid-out fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Payload size in bytes before word rounding.
    #[must_use]
    pub const fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Size in words of an object of this klass. `length` is ignored for
    /// instance kinds.
    #[must_use]
    pub const fn size_for(&self, length: usize) -> usize {
        if self.kind.is_array() {
            2 + length
        } else {
            self.instance_words
        }
    }

    /// Word offsets (from the object start) of the reference fields.
    #[must_use]
    pub fn oop_offsets(&self) -> &[usize] {
        &self.oop_offsets
    }

    /// The klass superseding this one, if a redefinition is pending.
    #[must_use]
    pub const fn new_version(&self) -> Option<KlassId> {
        self.new_version
    }

    /// The klass this one superseded, if any.
    #[must_use]
    pub const fn old_version(&self) -> Option<KlassId> {
        self.old_version
    }

    /// Field translation for instances migrating to this klass, or `None`
    /// when the layout is unchanged.
    #[must_use]
    pub const fn update_information(&self) -> Option<&CopyProgram> {
        self.update_information.as_ref()
    }

    /// Returns `true` if the klass can be unloaded once its holder dies.
    #[must_use]
    pub const fn has_holder(&self) -> bool {
        self.holder.is_some()
    }

    pub(crate) const fn holder_slot(&self) -> Option<&AtomicU64> {
        self.holder.as_ref()
    }

    /// Current address of the holder object.
    #[must_use]
    pub fn holder(&self) -> Option<HeapAddr> {
        self.holder
            .as_ref()
            .and_then(|slot| crate::heap::decode_oop(slot.load(Ordering::Relaxed)))
    }
}

/// All registered klasses, indexed by id.
#[derive(Debug, Default)]
pub struct KlassTable {
    klasses: Vec<Option<Klass>>,
}

impl KlassTable {
    /// Creates an empty table. Id 0 stays reserved.
    #[must_use]
    pub fn new() -> Self {
        Self {
            klasses: vec![None],
        }
    }

    /// Registers a klass.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidKlass`] if the definition does not lay out
    /// or the table is full.
    pub fn register(&mut self, def: &KlassDef, holder: Option<HeapAddr>) -> Result<KlassId, HeapError> {
        let raw = u32::try_from(self.klasses.len())
            .ok()
            .filter(|&id| id <= MAX_KLASS_ID)
            .ok_or_else(|| HeapError::InvalidKlass("klass table is full".into()))?;
        let id = KlassId(raw);
        let klass = Klass::from_def(id, def, holder)?;
        self.klasses.push(Some(klass));
        Ok(id)
    }

    /// Registers `def` as the new version of `old`.
    ///
    /// The new version shares the holder of the old one. Instances are
    /// migrated by the next full collection.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidKlass`] if `old` is unknown, is not an
    /// instance klass, already has a pending redefinition, or if `def`
    /// changes the kind.
    pub fn redefine(&mut self, old: KlassId, def: &KlassDef) -> Result<KlassId, HeapError> {
        let old_klass = self
            .try_get(old)
            .ok_or_else(|| HeapError::InvalidKlass(format!("unknown klass {}", old.0)))?;
        if old_klass.kind != KlassKind::Instance || def.kind != KlassKind::Instance {
            return Err(HeapError::InvalidKlass(format!(
                "only instance klasses can be redefined ({})",
                old_klass.name
            )));
        }
        if old_klass.new_version.is_some() {
            return Err(HeapError::InvalidKlass(format!(
                "{} already has a pending redefinition",
                old_klass.name
            )));
        }
        let holder = old_klass.holder();

        let new = self.register(def, holder)?;
        let program = CopyProgram::compute(self.get(old), self.get(new));
        if let Some(klass) = self.klasses[new.index()].as_mut() {
            klass.old_version = Some(old);
            klass.update_information = program;
        }
        if let Some(klass) = self.klasses[old.index()].as_mut() {
            klass.new_version = Some(new);
        }
        Ok(new)
    }

    /// Returns the klass for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was never registered or has been unloaded. A live
    /// object never refers to such a klass.
    #[must_use]
    pub fn get(&self, id: KlassId) -> &Klass {
        match self.try_get(id) {
            Some(klass) => klass,
            None => panic!("klass {} is not loaded", id.0),
        }
    }

    /// Returns the klass for `id`, if loaded.
    #[must_use]
    pub fn try_get(&self, id: KlassId) -> Option<&Klass> {
        self.klasses.get(id.index()).and_then(Option::as_ref)
    }

    /// Iterates over loaded klasses.
    pub fn iter(&self) -> impl Iterator<Item = &Klass> {
        self.klasses.iter().flatten()
    }

    /// Number of loaded klasses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns `true` if no klass is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if any klass has a pending new version.
    #[must_use]
    pub fn has_pending_redefinition(&self) -> bool {
        self.iter().any(|k| k.new_version.is_some())
    }

    /// Unlinks every klass whose holder is not live. Returns the number of
    /// klasses unloaded.
    pub(crate) fn unload_dead(&mut self, is_live: impl Fn(HeapAddr) -> bool) -> usize {
        let mut unloaded = 0;
        for entry in &mut self.klasses {
            let dead = entry
                .as_ref()
                .and_then(Klass::holder)
                .is_some_and(|holder| !is_live(holder));
            if dead {
                *entry = None;
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Unlinks superseded klass versions after their instances migrated.
    /// Versions in `retained` still have instances and stay linked.
    pub(crate) fn complete_redefinition(&mut self, retained: &HashSet<KlassId>) -> usize {
        let mut completed = 0;
        for entry in &mut self.klasses {
            let superseded = entry
                .as_ref()
                .is_some_and(|k| k.new_version.is_some() && !retained.contains(&k.id));
            if superseded {
                *entry = None;
                completed += 1;
            }
        }
        for klass in self.klasses.iter_mut().flatten() {
            if klass.old_version.is_some_and(|old| !retained.contains(&old)) {
                klass.old_version = None;
            }
        }
        completed
    }
}
