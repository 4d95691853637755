//! The membership table and the rules for changing it.
//!
//! Every member is identified by its address and carries a status and an
//! incarnation number. Conflicting claims are resolved by the rules in
//! [`rules`]: higher incarnations win, ties go to the worse status, and the
//! local member answers any claim that it is down with a fresher incarnation.

mod iterator;
#[allow(clippy::module_inception)]
mod membership;
mod member;
mod merge;
pub mod rules;

#[rustfmt::skip]
pub(crate) use {
  member::lenient_changes,
};

#[rustfmt::skip]
pub use {
  iterator::MembershipIterator,
  member::Change,
  member::Member,
  member::Status,
  member::now_millis,
  membership::Membership,
  membership::MembershipEvent,
  merge::merge_snapshots,
  merge::Merged,
  merge::Snapshot,
};
