//! The logical filesystem layer: object identity, head nodes, directories,
//! file data, and the free list, all expressed over a `BlockStore`.
mod alloc;
mod chain;
mod dirent;
mod head;
mod master;

use failure::{format_err, Error};
use log::{debug, trace};

use crate::error::AfsResult;
use crate::id::ObjId;
use crate::store::BlockStore;
use crate::time::AfsTime;

use alloc::Alloc;
use dirent::DirEntry;
pub use dirent::CaseSensitivity;
use head::{DirBody, DirHead, FileBody, FileHead, HeadNode, Kind};
pub use head::ObjType;
use master::MasterBlock;

/// A directory entry as returned by `dir_read`/`crack_path`.
#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub name: String,
    pub id: ObjId,
    pub obj_type: ObjType,
}

/// One resolved path component, as returned by `crack_path`.
#[derive(Clone, Debug)]
pub struct PathEntry {
    pub id: ObjId,
    pub name: String,
    pub obj_type: ObjType,
}

/// Snapshot of an object's metadata, as returned by `obj_stat`.
#[derive(Clone, Debug)]
pub struct ObjInfo {
    pub obj_type: ObjType,
    pub parent: ObjId,
    pub name: String,
    pub metadata: Vec<u8>,
    pub create_time: AfsTime,
    pub modify_time: AfsTime,
    /// File size in bytes, or directory entry count.
    pub size_or_entries: u64,
}

/// Requested field values for `obj_set_stat`; only fields set in the
/// accompanying `FieldMask` are applied.
#[derive(Clone, Debug)]
pub struct StatUpdate {
    pub create_time: AfsTime,
    pub modify_time: AfsTime,
    pub metadata: Vec<u8>,
}

/// Which fields of a `StatUpdate` to apply. All-`false` is accepted as a
/// no-op (see the Open Questions note in DESIGN.md).
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldMask {
    pub create_time: bool,
    pub modify_time: bool,
    pub metadata: bool,
}

/// The logical filesystem layer over a `BlockStore`.
///
/// Single-threaded: `Afs` does no internal locking, matching the
/// single-Afs-instance concurrency model it's specified against.
pub struct Afs<S: BlockStore> {
    store: S,
    case: CaseSensitivity,
}

impl<S: BlockStore> Afs<S> {
    /// Wrap an already-open `BlockStore`. Call `init` on a fresh store
    /// before any other operation.
    pub fn new(store: S, case: CaseSensitivity) -> Self {
        Afs { store, case }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn block_size(&self) -> usize {
        self.store.block_size() as usize
    }

    fn read_master(&self) -> Result<MasterBlock, Error> {
        let raw = self.store.obtain_block(0)?;
        MasterBlock::decode(&raw)
    }

    fn read_head(&self, id: ObjId) -> Result<HeadNode, Error> {
        let raw = self.store.obtain_block(id.hint())?;
        HeadNode::decode(&raw)
    }

    fn try_read_head(&self, id: ObjId) -> Result<Option<HeadNode>, Error> {
        match self.store.obtain_block(id.hint()) {
            Ok(raw) => Ok(Some(HeadNode::decode(&raw)?)),
            Err(_) => Ok(None),
        }
    }

    fn read_dir_entries(&self, dir: &DirHead) -> Result<Vec<DirEntry>, Error> {
        match &dir.body {
            DirBody::Inline(bytes) => {
                if bytes.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(dirent::decode(bytes)?)
                }
            }
            DirBody::Chain { chain_head, len } => {
                let raw = chain::read(&self.store, *chain_head, *len as usize).map_err(|e| format_err!("{:?}", e))?;
                Ok(dirent::decode(&raw)?)
            }
        }
    }

    /// Inline-entries capacity of `head`'s head block, given its current
    /// name and metadata. Mirrors `mini_capacity` for files.
    fn dir_inline_capacity(&self, head: &HeadNode) -> usize {
        let mut trial = head.clone();
        if let Kind::Dir(d) = &mut trial.kind {
            d.body = DirBody::Inline(Vec::new());
        }
        let base = bincode::serialize(&trial).expect("serializing a head node cannot fail").len();
        self.block_size().saturating_sub(base)
    }

    /// Rewrite `head`'s directory entries, choosing inline vs. chained
    /// storage by whether the serialized list still fits this head block.
    /// `head` must be a `Dir`; its `modify_time` is left untouched.
    fn write_dir_entries(&self, alloc: &mut Alloc, head: &mut HeadNode, entries: &[DirEntry]) -> Result<(), AfsResult> {
        let capacity = self.dir_inline_capacity(head);
        let bytes = if entries.is_empty() {
            Vec::new()
        } else {
            dirent::encode(entries).expect("serializing directory entries cannot fail")
        };

        let old_chain_head = match &head.as_dir().expect("caller passed a Dir head").body {
            DirBody::Chain { chain_head, .. } => Some(*chain_head),
            DirBody::Inline(_) => None,
        };

        let new_body = if bytes.len() <= capacity {
            if let Some(old_head) = old_chain_head {
                chain::free_all(&self.store, alloc, Some(old_head))?;
            }
            DirBody::Inline(bytes)
        } else {
            let new_chain_head = chain::write(&self.store, alloc, old_chain_head, &bytes)?;
            DirBody::Chain {
                chain_head: new_chain_head,
                len: bytes.len() as u64,
            }
        };

        let dir = head.as_dir_mut().expect("caller passed a Dir head");
        dir.body = new_body;
        dir.entry_count = entries.len() as u64;
        Ok(())
    }

    fn read_file_data(&self, file: &FileHead) -> Result<Vec<u8>, Error> {
        match &file.body {
            FileBody::Mini(data) => Ok(data.clone()),
            FileBody::Tree { chain_head } => {
                chain::read(&self.store, *chain_head, file.size as usize).map_err(|e| format_err!("{:?}", e))
            }
        }
    }

    /// Inline-data capacity of `head`'s head block, given its current name
    /// and metadata. Computed by actually serializing a trial head node
    /// rather than an estimate, so it tracks `bincode`'s wire format
    /// exactly.
    fn mini_capacity(&self, head: &HeadNode) -> usize {
        let mut trial = head.clone();
        if let Kind::File(f) = &mut trial.kind {
            f.body = FileBody::Mini(Vec::new());
        }
        let base = bincode::serialize(&trial).expect("serializing a head node cannot fail").len();
        self.block_size().saturating_sub(base)
    }

    /// Largest name, in bytes, that fits in a head node of either type
    /// with empty metadata. `dir_create`/`file_create`/`obj_move` reject
    /// longer names up front.
    pub fn max_name_bytes(&self) -> usize {
        let now = AfsTime::now();
        let dir_trial = HeadNode {
            parent: ObjId::root(),
            name: String::new(),
            metadata: Vec::new(),
            create_time: now,
            modify_time: now,
            kind: Kind::Dir(DirHead::default()),
        };
        let file_trial = HeadNode {
            kind: Kind::File(FileHead {
                size: 0,
                body: FileBody::Mini(Vec::new()),
            }),
            ..dir_trial.clone()
        };
        let dir_base = bincode::serialize(&dir_trial).expect("serializing a head node cannot fail").len();
        let file_base = bincode::serialize(&file_trial).expect("serializing a head node cannot fail").len();
        self.block_size().saturating_sub(dir_base.max(file_base))
    }

    /// Initialize an empty store as a fresh Afs: installs the master block
    /// and an empty root directory.
    pub fn init(&mut self, metadata: &[u8], now: AfsTime) -> Result<(), Error> {
        if self.store.nr_blocks() != 0 {
            return Err(format_err!("init called on a non-empty store"));
        }
        let block_size = self.block_size();
        let root_idx = crate::id::ROOT_HEAD_INDEX;

        let root = HeadNode {
            parent: ObjId::root(),
            name: String::new(),
            metadata: metadata.to_vec(),
            create_time: now,
            modify_time: now,
            kind: Kind::Dir(DirHead::default()),
        };
        let root_bytes = root.encode(block_size)?;
        let master = MasterBlock::new(self.store.block_size(), root_idx);
        let master_bytes = master.encode(block_size)?;

        let mut batch = self.store.begin_journaled_write()?;
        let m = batch.add_new_block(master_bytes);
        let r = batch.add_new_block(root_bytes);
        debug_assert_eq!(m, 0);
        debug_assert_eq!(r, root_idx);
        self.store.complete_journaled_write(batch)?;
        debug!("Afs initialized: block_size={}", self.store.block_size());
        Ok(())
    }

    /// Resolve a `/`-separated path to its sequence of (id, name, type)
    /// entries. `/` alone yields an empty sequence.
    pub fn crack_path(&self, path: &str) -> Result<(AfsResult, Vec<PathEntry>), Error> {
        let mut out = Vec::new();
        let mut current = ObjId::root();
        for comp in path.split('/').filter(|s| !s.is_empty()) {
            let head = self.read_head(current)?;
            let dir = match head.as_dir() {
                Some(d) => d,
                None => return Ok((AfsResult::ObjNotFound, out)),
            };
            let entries = self.read_dir_entries(dir)?;
            match dirent::find(&entries, comp, self.case) {
                Some((_, e)) => {
                    out.push(PathEntry {
                        id: e.id,
                        name: e.name.clone(),
                        obj_type: e.obj_type,
                    });
                    current = e.id;
                }
                None => return Ok((AfsResult::NameNotInDir, out)),
            }
        }
        Ok((AfsResult::Ok, out))
    }

    fn create_object(
        &mut self,
        parent_id: ObjId,
        name: &str,
        metadata: &[u8],
        now: AfsTime,
        obj_type: ObjType,
    ) -> Result<(AfsResult, Option<ObjId>), Error> {
        if name.len() > self.max_name_bytes() {
            return Err(format_err!("name exceeds MaxNameBytes ({})", self.max_name_bytes()));
        }

        let mut parent_head = self.read_head(parent_id)?;
        let parent_dir = match parent_head.as_dir() {
            Some(d) => d.clone(),
            None => return Ok((AfsResult::ObjNotFound, None)),
        };
        let mut entries = self.read_dir_entries(&parent_dir)?;
        if dirent::find(&entries, name, self.case).is_some() {
            return Ok((AfsResult::NameExists, None));
        }

        let master = self.read_master()?;
        let block_size = self.block_size();
        let mut batch = self.store.begin_journaled_write()?;
        let mut alloc = Alloc::new(
            &mut batch,
            self.store.nr_blocks(),
            self.store.max_nr_blocks(),
            master.free_list_head,
            master.nr_free_blocks,
        );

        let kind = match obj_type {
            ObjType::Dir => Kind::Dir(DirHead::default()),
            ObjType::File => Kind::File(FileHead {
                size: 0,
                body: FileBody::Mini(Vec::new()),
            }),
        };
        let new_head = HeadNode {
            parent: parent_id,
            name: name.to_string(),
            metadata: metadata.to_vec(),
            create_time: now,
            modify_time: now,
            kind,
        };
        let new_bytes = match new_head.encode(block_size) {
            Ok(b) => b,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Err(e);
            }
        };
        let new_idx = match alloc.alloc(&self.store, new_bytes) {
            Ok(idx) => idx,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Ok((e, None));
            }
        };
        let new_id = ObjId::new(new_idx);

        dirent::insert(
            &mut entries,
            DirEntry {
                name: name.to_string(),
                id: new_id,
                obj_type,
            },
        );
        if let Err(e) = self.write_dir_entries(&mut alloc, &mut parent_head, &entries) {
            self.store.abort_journaled_write(batch);
            return Ok((e, None));
        }
        parent_head.modify_time = now;
        let parent_bytes = match parent_head.encode(block_size) {
            Ok(b) => b,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Err(e);
            }
        };
        alloc.overwrite(parent_id.hint(), parent_bytes);

        let (free_head, nr_free) = alloc.into_free_state();
        let mut master = master;
        master.free_list_head = free_head;
        master.nr_free_blocks = nr_free;
        batch.overwrite(0, master.encode(block_size)?);

        self.store.complete_journaled_write(batch)?;
        trace!("created {:?} {:?} under {:?}", obj_type, name, parent_id.hint());
        Ok((AfsResult::Ok, Some(new_id)))
    }

    pub fn dir_create(
        &mut self,
        parent: ObjId,
        name: &str,
        metadata: &[u8],
        now: AfsTime,
    ) -> Result<(AfsResult, Option<ObjId>), Error> {
        self.create_object(parent, name, metadata, now, ObjType::Dir)
    }

    pub fn file_create(
        &mut self,
        parent: ObjId,
        name: &str,
        metadata: &[u8],
        now: AfsTime,
    ) -> Result<(AfsResult, Option<ObjId>), Error> {
        self.create_object(parent, name, metadata, now, ObjType::File)
    }

    pub fn obj_stat(&self, id: ObjId) -> Result<(AfsResult, Option<ObjInfo>), Error> {
        let head = match self.try_read_head(id)? {
            Some(h) => h,
            None => return Ok((AfsResult::ObjNotFound, None)),
        };
        let size_or_entries = match &head.kind {
            Kind::Dir(d) => d.entry_count,
            Kind::File(f) => f.size,
        };
        Ok((
            AfsResult::Ok,
            Some(ObjInfo {
                obj_type: head.obj_type(),
                parent: head.parent,
                name: head.name.clone(),
                metadata: head.metadata.clone(),
                create_time: head.create_time,
                modify_time: head.modify_time,
                size_or_entries,
            }),
        ))
    }

    pub fn obj_set_stat(&mut self, id: ObjId, update: &StatUpdate, mask: FieldMask) -> Result<AfsResult, Error> {
        if !mask.create_time && !mask.modify_time && !mask.metadata {
            // Zero field-mask is accepted as a no-op; see DESIGN.md.
            return Ok(AfsResult::Ok);
        }
        let mut head = match self.try_read_head(id)? {
            Some(h) => h,
            None => return Ok(AfsResult::ObjNotFound),
        };
        if mask.create_time {
            head.create_time = update.create_time;
        }
        if mask.modify_time {
            head.modify_time = update.modify_time;
        }
        if mask.metadata {
            head.metadata = update.metadata.clone();
        }

        let block_size = self.block_size();
        let bytes = head.encode(block_size)?;
        let mut batch = self.store.begin_journaled_write()?;
        batch.overwrite(id.hint(), bytes);
        self.store.complete_journaled_write(batch)?;
        Ok(AfsResult::Ok)
    }

    pub fn obj_move(
        &mut self,
        from_parent: ObjId,
        name: &str,
        to_parent: ObjId,
        new_name: &str,
        now: AfsTime,
    ) -> Result<AfsResult, Error> {
        if new_name.len() > self.max_name_bytes() {
            return Err(format_err!("name exceeds MaxNameBytes ({})", self.max_name_bytes()));
        }

        let mut from_parent_head = self.read_head(from_parent)?;
        let from_dir = match from_parent_head.as_dir() {
            Some(d) => d.clone(),
            None => return Ok(AfsResult::ObjNotFound),
        };
        let mut from_entries = self.read_dir_entries(&from_dir)?;
        let (from_idx, moved) = match dirent::find(&from_entries, name, self.case) {
            Some((i, e)) => (i, e.clone()),
            None => return Ok(AfsResult::NameNotInDir),
        };

        if moved.obj_type == ObjType::Dir {
            let mut cur = to_parent;
            loop {
                if cur == moved.id {
                    return Ok(AfsResult::MoveDestInvalid);
                }
                if cur.is_root() {
                    break;
                }
                let parent = self.read_head(cur)?.parent;
                if parent == cur {
                    break;
                }
                cur = parent;
            }
        }

        let rename_only = from_parent == to_parent;
        let mut to_parent_head = if rename_only {
            from_parent_head.clone()
        } else {
            self.read_head(to_parent)?
        };
        let to_dir = match to_parent_head.as_dir() {
            Some(d) => d.clone(),
            None => return Ok(AfsResult::ObjNotFound),
        };

        dirent::remove(&mut from_entries, from_idx);
        let mut dest_entries = if rename_only {
            from_entries.clone()
        } else {
            self.read_dir_entries(&to_dir)?
        };
        if dirent::find(&dest_entries, new_name, self.case).is_some() {
            return Ok(AfsResult::NameExists);
        }
        dirent::insert(
            &mut dest_entries,
            DirEntry {
                name: new_name.to_string(),
                id: moved.id,
                obj_type: moved.obj_type,
            },
        );

        let master = self.read_master()?;
        let block_size = self.block_size();
        let mut batch = self.store.begin_journaled_write()?;
        let mut alloc = Alloc::new(
            &mut batch,
            self.store.nr_blocks(),
            self.store.max_nr_blocks(),
            master.free_list_head,
            master.nr_free_blocks,
        );

        if rename_only {
            if let Err(e) = self.write_dir_entries(&mut alloc, &mut from_parent_head, &dest_entries) {
                self.store.abort_journaled_write(batch);
                return Ok(e);
            }
            from_parent_head.modify_time = now;
            let bytes = match from_parent_head.encode(block_size) {
                Ok(b) => b,
                Err(e) => {
                    self.store.abort_journaled_write(batch);
                    return Err(e);
                }
            };
            alloc.overwrite(from_parent.hint(), bytes);
        } else {
            if let Err(e) = self.write_dir_entries(&mut alloc, &mut from_parent_head, &from_entries) {
                self.store.abort_journaled_write(batch);
                return Ok(e);
            }
            if let Err(e) = self.write_dir_entries(&mut alloc, &mut to_parent_head, &dest_entries) {
                self.store.abort_journaled_write(batch);
                return Ok(e);
            }

            from_parent_head.modify_time = now;
            let from_bytes = match from_parent_head.encode(block_size) {
                Ok(b) => b,
                Err(e) => {
                    self.store.abort_journaled_write(batch);
                    return Err(e);
                }
            };
            alloc.overwrite(from_parent.hint(), from_bytes);

            to_parent_head.modify_time = now;
            let to_bytes = match to_parent_head.encode(block_size) {
                Ok(b) => b,
                Err(e) => {
                    self.store.abort_journaled_write(batch);
                    return Err(e);
                }
            };
            alloc.overwrite(to_parent.hint(), to_bytes);
        }

        let mut moved_head = self.read_head(moved.id)?;
        moved_head.parent = to_parent;
        moved_head.name = new_name.to_string();
        moved_head.modify_time = now;
        let moved_bytes = match moved_head.encode(block_size) {
            Ok(b) => b,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Err(e);
            }
        };
        alloc.overwrite(moved.id.hint(), moved_bytes);

        let (free_head, nr_free) = alloc.into_free_state();
        let mut master = master;
        master.free_list_head = free_head;
        master.nr_free_blocks = nr_free;
        batch.overwrite(0, master.encode(block_size)?);

        self.store.complete_journaled_write(batch)?;
        Ok(AfsResult::Ok)
    }

    /// Remove a file, or an empty directory, from `parent`. Deleting a
    /// non-empty directory is caller error (the caller is expected to
    /// empty it first via `dir_read`, per the recursive-delete contract);
    /// this returns an `Err` rather than an `AfsResult` since it isn't one
    /// of the stable operational outcomes.
    pub fn obj_delete(&mut self, parent: ObjId, name: &str, now: AfsTime) -> Result<AfsResult, Error> {
        let mut parent_head = self.read_head(parent)?;
        let parent_dir = match parent_head.as_dir() {
            Some(d) => d.clone(),
            None => return Ok(AfsResult::ObjNotFound),
        };
        let mut entries = self.read_dir_entries(&parent_dir)?;
        let (idx, entry) = match dirent::find(&entries, name, self.case) {
            Some((i, e)) => (i, e.clone()),
            None => return Ok(AfsResult::NameNotInDir),
        };

        let victim_head = self.read_head(entry.id)?;
        if let Kind::Dir(d) = &victim_head.kind {
            if d.entry_count > 0 {
                return Err(format_err!("cannot delete non-empty directory {:?}", name));
            }
        }

        let master = self.read_master()?;
        let block_size = self.block_size();
        let mut batch = self.store.begin_journaled_write()?;
        let mut alloc = Alloc::new(
            &mut batch,
            self.store.nr_blocks(),
            self.store.max_nr_blocks(),
            master.free_list_head,
            master.nr_free_blocks,
        );

        if let Kind::File(f) = &victim_head.kind {
            if let FileBody::Tree { chain_head } = f.body {
                if chain::free_all(&self.store, &mut alloc, Some(chain_head)).is_err() {
                    self.store.abort_journaled_write(batch);
                    return Err(format_err!("corrupt file data chain"));
                }
            }
        }
        alloc.free(entry.id.hint(), self.store.block_size());

        dirent::remove(&mut entries, idx);
        if let Err(e) = self.write_dir_entries(&mut alloc, &mut parent_head, &entries) {
            self.store.abort_journaled_write(batch);
            return Ok(e);
        }
        parent_head.modify_time = now;
        let parent_bytes = match parent_head.encode(block_size) {
            Ok(b) => b,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Err(e);
            }
        };
        alloc.overwrite(parent.hint(), parent_bytes);

        let (free_head, nr_free) = alloc.into_free_state();
        let mut master = master;
        master.free_list_head = free_head;
        master.nr_free_blocks = nr_free;
        batch.overwrite(0, master.encode(block_size)?);

        self.store.complete_journaled_write(batch)?;
        Ok(AfsResult::Ok)
    }

    /// Stream a directory's entries in tree order, resuming after
    /// `last_name_read`. `max_entries == 0` means "no cap"; the whole
    /// remainder is returned in one call.
    pub fn dir_read(
        &self,
        id: ObjId,
        last_name_read: Option<&str>,
        max_entries: usize,
    ) -> Result<(AfsResult, Vec<DirEntryInfo>, bool), Error> {
        let head = match self.try_read_head(id)? {
            Some(h) => h,
            None => return Ok((AfsResult::ObjNotFound, Vec::new(), true)),
        };
        let dir = match head.as_dir() {
            Some(d) => d,
            None => return Ok((AfsResult::ObjNotFound, Vec::new(), true)),
        };
        let entries = self.read_dir_entries(dir)?;

        let start = match last_name_read {
            None => 0,
            Some(last) => match entries.iter().position(|e| self.case.matches(&e.name, last)) {
                Some(i) => i + 1,
                None => entries.len(),
            },
        };
        let start = start.min(entries.len());
        let remaining = &entries[start..];
        let take = if max_entries == 0 {
            remaining.len()
        } else {
            max_entries.min(remaining.len())
        };
        let page = remaining[..take]
            .iter()
            .map(|e| DirEntryInfo {
                name: e.name.clone(),
                id: e.id,
                obj_type: e.obj_type,
            })
            .collect();
        let reached_end = start + take >= entries.len();

        Ok((AfsResult::Ok, page, reached_end))
    }

    /// Write `data` at `offset`, zero-filling any gap and extending the
    /// file as needed. Promotes from inline ("mini") storage to an
    /// external data tree once the new size exceeds mini-node capacity.
    pub fn file_write(&mut self, id: ObjId, offset: u64, data: &[u8], now: AfsTime) -> Result<AfsResult, Error> {
        offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| format_err!("offset + len overflows u64"))?;

        let mut head = self.read_head(id)?;
        let mut file = match head.as_file() {
            Some(f) => f.clone(),
            None => return Ok(AfsResult::ObjNotFound),
        };

        let mut content = self.read_file_data(&file)?;
        let start = offset as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);

        let mini_capacity = self.mini_capacity(&head);
        let master = self.read_master()?;
        let block_size = self.block_size();
        let mut batch = self.store.begin_journaled_write()?;
        let mut alloc = Alloc::new(
            &mut batch,
            self.store.nr_blocks(),
            self.store.max_nr_blocks(),
            master.free_list_head,
            master.nr_free_blocks,
        );

        let new_body = if content.len() <= mini_capacity {
            if let FileBody::Tree { chain_head } = file.body {
                if chain::free_all(&self.store, &mut alloc, Some(chain_head)).is_err() {
                    self.store.abort_journaled_write(batch);
                    return Err(format_err!("corrupt file data chain"));
                }
            }
            FileBody::Mini(content.clone())
        } else {
            let old_head = match file.body {
                FileBody::Tree { chain_head } => Some(chain_head),
                FileBody::Mini(_) => None,
            };
            match chain::write(&self.store, &mut alloc, old_head, &content) {
                Ok(new_chain_head) => FileBody::Tree { chain_head: new_chain_head },
                Err(e) => {
                    self.store.abort_journaled_write(batch);
                    return Ok(e);
                }
            }
        };

        file.size = content.len() as u64;
        file.body = new_body;
        *head.as_file_mut().expect("checked above") = file;
        head.modify_time = now;
        let bytes = match head.encode(block_size) {
            Ok(b) => b,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Err(e);
            }
        };
        alloc.overwrite(id.hint(), bytes);

        let (free_head, nr_free) = alloc.into_free_state();
        let mut master = master;
        master.free_list_head = free_head;
        master.nr_free_blocks = nr_free;
        batch.overwrite(0, master.encode(block_size)?);

        self.store.complete_journaled_write(batch)?;
        Ok(AfsResult::Ok)
    }

    /// Read up to `max_len` bytes starting at `offset`. Returns the chunk
    /// read (possibly shorter than `max_len` at EOF) and whether EOF was
    /// reached. A true multi-chunk callback API (as in the spec's
    /// `onData`) is not implemented; the design notes call batched return
    /// an acceptable alternative (see DESIGN.md).
    pub fn file_read(&self, id: ObjId, offset: u64, max_len: u64) -> Result<(AfsResult, Vec<u8>, bool), Error> {
        let head = match self.try_read_head(id)? {
            Some(h) => h,
            None => return Ok((AfsResult::ObjNotFound, Vec::new(), true)),
        };
        let file = match head.as_file() {
            Some(f) => f,
            None => return Ok((AfsResult::ObjNotFound, Vec::new(), true)),
        };
        if offset >= file.size {
            return Ok((AfsResult::Ok, Vec::new(), true));
        }
        let content = self.read_file_data(file)?;
        let end = (offset.saturating_add(max_len)).min(file.size) as usize;
        let chunk = content[offset as usize..end].to_vec();
        let reached_end = end as u64 >= file.size;
        Ok((AfsResult::Ok, chunk, reached_end))
    }

    /// Grow or shrink a file. On `OutOfSpace` during growth, the achieved
    /// size (possibly short of `new_size`) is returned with `AfsResult::Ok`
    /// rather than failing the call, per the spec's partial-growth
    /// contract; the achieved size is computed from the store's available
    /// capacity before any blocks are touched, so the actual write below
    /// always succeeds.
    pub fn file_set_size(&mut self, id: ObjId, new_size: u64, now: AfsTime) -> Result<(AfsResult, u64), Error> {
        let mut head = self.read_head(id)?;
        let file = match head.as_file() {
            Some(f) => f.clone(),
            None => return Ok((AfsResult::ObjNotFound, 0)),
        };

        let mini_capacity = self.mini_capacity(&head) as u64;
        let current = self.read_file_data(&file)?;
        let master = self.read_master()?;
        let block_size = self.block_size();
        let chunk_len = (block_size - chain::NEXT_LEN) as u64;

        let old_chain_len = match &file.body {
            FileBody::Tree { chain_head } => chain::walk(&self.store, Some(*chain_head))
                .map_err(|_| format_err!("corrupt file data chain"))?
                .len() as u64,
            FileBody::Mini(_) => 0,
        };

        let achieved = if new_size <= current.len() as u64 || new_size <= mini_capacity {
            new_size
        } else {
            let max_chunks =
                old_chain_len + master.nr_free_blocks + self.store.max_nr_blocks().saturating_sub(self.store.nr_blocks());
            let max_bytes = max_chunks.saturating_mul(chunk_len).max(mini_capacity);
            new_size.min(max_bytes)
        };

        let mut content = current;
        content.resize(achieved as usize, 0);

        let mut batch = self.store.begin_journaled_write()?;
        let mut alloc = Alloc::new(
            &mut batch,
            self.store.nr_blocks(),
            self.store.max_nr_blocks(),
            master.free_list_head,
            master.nr_free_blocks,
        );

        let new_body = if content.len() as u64 <= mini_capacity {
            if let FileBody::Tree { chain_head } = file.body {
                if chain::free_all(&self.store, &mut alloc, Some(chain_head)).is_err() {
                    self.store.abort_journaled_write(batch);
                    return Err(format_err!("corrupt file data chain"));
                }
            }
            FileBody::Mini(content.clone())
        } else {
            let old_head = match file.body {
                FileBody::Tree { chain_head } => Some(chain_head),
                FileBody::Mini(_) => None,
            };
            match chain::write(&self.store, &mut alloc, old_head, &content) {
                Ok(new_chain_head) => FileBody::Tree { chain_head: new_chain_head },
                Err(e) => {
                    self.store.abort_journaled_write(batch);
                    return Ok((e, 0));
                }
            }
        };

        let mut file = file;
        file.size = content.len() as u64;
        file.body = new_body;
        *head.as_file_mut().expect("checked above") = file;
        head.modify_time = now;
        let bytes = match head.encode(block_size) {
            Ok(b) => b,
            Err(e) => {
                self.store.abort_journaled_write(batch);
                return Err(e);
            }
        };
        alloc.overwrite(id.hint(), bytes);

        let (free_head, nr_free) = alloc.into_free_state();
        let mut master = master;
        master.free_list_head = free_head;
        master.nr_free_blocks = nr_free;
        batch.overwrite(0, master.encode(block_size)?);

        self.store.complete_journaled_write(batch)?;
        Ok((AfsResult::Ok, content.len() as u64))
    }

    pub fn file_max_mini_node_bytes(&self, id: ObjId) -> Result<(AfsResult, Option<u64>), Error> {
        let head = match self.try_read_head(id)? {
            Some(h) => h,
            None => return Ok((AfsResult::ObjNotFound, None)),
        };
        if head.as_file().is_none() {
            return Ok((AfsResult::ObjNotFound, None));
        }
        Ok((AfsResult::Ok, Some(self.mini_capacity(&head) as u64)))
    }

    pub fn free_space_blocks(&self) -> Result<u64, Error> {
        let master = self.read_master()?;
        Ok(master.nr_free_blocks + self.store.max_nr_blocks().saturating_sub(self.store.nr_blocks()))
    }

    pub fn free_space_bytes(&self) -> Result<u64, Error> {
        Ok(self.free_space_blocks()? * self.store.block_size() as u64)
    }

    /// Walk the free list, confirming no cycle and no duplicate entry.
    pub fn verify_free_list(&self) -> Result<(), Error> {
        let master = self.read_master()?;
        let mut seen = std::collections::HashSet::new();
        let mut cur = master.free_list_head;
        while let Some(idx) = cur {
            if !seen.insert(idx) {
                return Err(format_err!("free list cycle or duplicate at block {}", idx));
            }
            let raw = self.store.obtain_block(idx)?;
            cur = chain::decode_next(&raw);
        }
        if seen.len() as u64 != master.nr_free_blocks {
            return Err(format_err!(
                "free list count mismatch: walked {} but master records {}",
                seen.len(),
                master.nr_free_blocks
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_afs(block_size: u32, max_blocks: u64) -> Afs<MemStore> {
        let store = MemStore::new(block_size, max_blocks);
        let mut afs = Afs::new(store, CaseSensitivity::Insensitive);
        afs.init(b"", AfsTime::now()).unwrap();
        afs
    }

    #[test]
    fn s1_no_free_blocks() {
        init_logger();
        let mut afs = new_afs(256, 2);
        assert_eq!(afs.free_space_blocks().unwrap(), 0);
        let (r, _) = afs.dir_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::OutOfSpace);
        let (r, _) = afs.file_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::OutOfSpace);
    }

    #[test]
    fn s2_one_free_block_case_insensitive() {
        init_logger();
        let mut afs = new_afs(256, 3);
        assert_eq!(afs.free_space_blocks().unwrap(), 1);

        let (r, dir_id) = afs.dir_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let dir_id = dir_id.unwrap();
        assert_eq!(afs.free_space_blocks().unwrap(), 0);

        let (r, _) = afs.dir_create(ObjId::root(), "A", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::NameExists);
        let (r, _) = afs.file_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::NameExists);
        let (r, _) = afs.file_create(ObjId::root(), "b", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::OutOfSpace);

        let (r, entries) = afs.crack_path("/A").unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].id, dir_id);

        let r = afs.obj_delete(ObjId::root(), "A", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_eq!(afs.free_space_blocks().unwrap(), 1);

        let (r, file_id) = afs.file_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_ne!(file_id.unwrap(), dir_id);
        assert_eq!(afs.free_space_blocks().unwrap(), 0);
    }

    #[test]
    fn s3_mini_node_to_data_tree_promotion() {
        init_logger();
        let mut afs = new_afs(256, 4);
        let (r, _) = afs.dir_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let (r, b) = afs.file_create(ObjId::root(), "b", b"", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let b = b.unwrap();

        let (r, max) = afs.file_max_mini_node_bytes(b).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let m = max.unwrap() as usize;

        let mut content = vec![b'1'; m];
        let r = afs.file_write(b, 0, &content, AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let (r, info) = afs.obj_stat(b).unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_eq!(info.unwrap().size_or_entries, m as u64);
        let (r, read_back, end) = afs.file_read(b, 0, 10_000).unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert!(end);
        assert_eq!(read_back, content);

        // one more byte -> OutOfSpace (no free blocks left for a data tree)
        let r = afs.file_write(b, m as u64, b"2", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::OutOfSpace);

        let r = afs.obj_delete(ObjId::root(), "a", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);

        content.push(b'2');
        let r = afs.file_write(b, 0, &content, AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let (r, info) = afs.obj_stat(b).unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_eq!(info.unwrap().size_or_entries, (m + 1) as u64);
        let (r, read_back, _) = afs.file_read(b, 0, 10_000).unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_eq!(read_back, content);
        assert_eq!(afs.free_space_blocks().unwrap(), 0);
    }

    #[test]
    fn rename_within_same_directory() {
        init_logger();
        let mut afs = new_afs(512, 10);
        let (_, id) = afs.file_create(ObjId::root(), "old", b"", AfsTime::now()).unwrap();
        let id = id.unwrap();
        let r = afs.obj_move(ObjId::root(), "old", ObjId::root(), "new", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::Ok);
        let (r, entries) = afs.crack_path("/new").unwrap();
        assert_eq!(r, AfsResult::Ok);
        assert_eq!(entries[0].id, id);
        let (r, _) = afs.crack_path("/old").unwrap();
        assert_eq!(r, AfsResult::NameNotInDir);
    }

    #[test]
    fn move_dir_into_its_own_descendant_is_rejected() {
        init_logger();
        let mut afs = new_afs(512, 10);
        let (_, a) = afs.dir_create(ObjId::root(), "a", b"", AfsTime::now()).unwrap();
        let a = a.unwrap();
        let (_, b) = afs.dir_create(a, "b", b"", AfsTime::now()).unwrap();
        let b = b.unwrap();
        let r = afs.obj_move(ObjId::root(), "a", b, "a", AfsTime::now()).unwrap();
        assert_eq!(r, AfsResult::MoveDestInvalid);
    }

    #[test]
    fn verify_free_list_passes_after_churn() {
        init_logger();
        let mut afs = new_afs(256, 10);
        for i in 0..5 {
            let name = format!("f{}", i);
            afs.file_create(ObjId::root(), &name, b"", AfsTime::now()).unwrap();
        }
        for i in 0..5 {
            let name = format!("f{}", i);
            afs.obj_delete(ObjId::root(), &name, AfsTime::now()).unwrap();
        }
        afs.verify_free_list().unwrap();
        assert_eq!(afs.free_space_blocks().unwrap(), 8);
    }
}
