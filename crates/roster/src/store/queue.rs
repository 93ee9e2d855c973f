//! Per-(table, address family) scheduling queue: one ordered sublist per
//! lifecycle state plus a group -> handle index and a group -> timestamp map.
//!
//! Timestamps are refreshed on every move. Each sublist is therefore in
//! nondecreasing order of last state change, which is what lets the
//! allocator stop scanning a sublist at the first entry that is too fresh.

use std::collections::HashMap;

use crate::store::list::{NodeRef, OrderedList};
use crate::types::{Error, GroupId, StatusKind};

#[derive(Debug, Default)]
pub struct WorkQueue {
	lists: [OrderedList<GroupId>; 4],
	index: HashMap<GroupId, (StatusKind, NodeRef)>,
	timestamps: HashMap<GroupId, u64>,
}

impl WorkQueue {
	pub fn add(&mut self, group_id: GroupId, kind: StatusKind, now: u64) -> Result<(), Error> {
		if self.index.contains_key(&group_id) {
			return Err(Error::AlreadyQueued(group_id));
		}
		let handle = self.lists[kind.idx()].push_back(group_id);
		self.index.insert(group_id, (kind, handle));
		self.timestamps.insert(group_id, now);
		Ok(())
	}

	/// Unlink from the current sublist and append to the tail of `kind`,
	/// refreshing the group's timestamp.
	pub fn move_to(&mut self, group_id: GroupId, kind: StatusKind, now: u64) -> Result<(), Error> {
		let (from, handle) = self
			.index
			.get(&group_id)
			.copied()
			.ok_or(Error::UnknownGroup(group_id))?;
		self.lists[from.idx()]
			.remove(handle)
			.ok_or(Error::UnknownGroup(group_id))?;
		let handle = self.lists[kind.idx()].push_back(group_id);
		self.index.insert(group_id, (kind, handle));
		self.timestamps.insert(group_id, now);
		Ok(())
	}

	pub fn remove(&mut self, group_id: GroupId) -> Result<(), Error> {
		let (kind, handle) = self
			.index
			.remove(&group_id)
			.ok_or(Error::UnknownGroup(group_id))?;
		self.lists[kind.idx()].remove(handle);
		self.timestamps.remove(&group_id);
		Ok(())
	}

	pub fn pop_available(&mut self) -> Option<GroupId> {
		let group_id = self.lists[StatusKind::Available.idx()].pop_front()?;
		self.index.remove(&group_id);
		self.timestamps.remove(&group_id);
		Some(group_id)
	}

	pub fn iter(&self, kind: StatusKind) -> impl Iterator<Item = GroupId> + '_ {
		self.lists[kind.idx()].iter().copied()
	}

	pub fn kind_of(&self, group_id: GroupId) -> Option<StatusKind> {
		self.index.get(&group_id).map(|(kind, _)| *kind)
	}

	pub fn timestamp(&self, group_id: GroupId) -> Option<u64> {
		self.timestamps.get(&group_id).copied()
	}

	pub fn len(&self, kind: StatusKind) -> usize {
		self.lists[kind.idx()].len()
	}
}
