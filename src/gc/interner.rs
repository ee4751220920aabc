use ahash::AHashMap;
use std::rc::Rc;

/// VM-wide interned runtime string pool, keyed by content hash.
///
/// Ground: `gc/string_interner.rs` in the teacher. Per spec §9's resolved
/// ambiguity ("specify content equality uniformly"), every runtime string
/// — whether it originated from a chunk's constant pool or was built at
/// runtime (concatenation, `tostring`, ...) — is interned here, so two
/// `StringId`s are equal iff their contents are equal.
#[derive(Default)]
pub struct StringInterner {
    by_content: AHashMap<Rc<str>, u32>,
    strings: super::ObjectPool<Rc<str>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.by_content.get(s) {
            return id;
        }
        let rc: Rc<str> = Rc::from(s);
        let id = self.strings.insert(rc.clone());
        self.by_content.insert(rc, id);
        id
    }

    pub fn get(&self, id: u32) -> &str {
        self.strings
            .get(id)
            .map(|s| s.as_ref())
            .unwrap_or_else(|| panic!("dangling string id {id}"))
    }

    pub fn pool(&self) -> &super::ObjectPool<Rc<str>> {
        &self.strings
    }

    pub fn pool_mut(&mut self) -> &mut super::ObjectPool<Rc<str>> {
        &mut self.strings
    }

    /// Drop interner entries for strings the last sweep collected, so the
    /// content->id map doesn't accumulate stale ids forever.
    pub fn retain_live(&mut self) {
        self.by_content.retain(|_, id| self.strings.get(*id).is_some());
    }
}
