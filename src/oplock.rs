//! The oplock engine: grant policy, server-initiated breaks, and the wait
//! for the holder's acknowledgement.
//!
//! A break is an unsolicited response-shaped `LockingAndX` frame written to
//! the holder's connection. Break-to-LEVEL_II expects the holder to answer
//! with a matching `LockingAndX` ack; break-to-NONE of level-II holders
//! expects nothing. While a break is pending, every new open of the entry
//! waits on [`FileState::break_done`] with the entry mutex released; if the
//! configured timeout passes, the oplock is treated as cleared and the open
//! proceeds.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tracing::{debug, warn};

use crate::codec::header::{Command, Header};
use crate::codec::packet::ReplyBuilder;
use crate::message_types::Outgoing;
use crate::state::{FileState, OplockLevel, OplockOwner, PendingBreak, StateInner};

/// `TypeOfLock` bits of `LockingAndX`.
pub mod lock_type {
    pub const SHARED_LOCK: u8 = 0x01;
    pub const OPLOCK_RELEASE: u8 = 0x02;
    pub const CHANGE_LOCKTYPE: u8 = 0x04;
    pub const CANCEL_LOCK: u8 = 0x08;
    pub const LARGE_FILES: u8 = 0x10;
}

/// Oplock level to grant a fresh opener, per policy: sole opener gets
/// BATCH, an entry whose exclusive holder is gone (or never was) gets
/// LEVEL_II, anything else gets nothing. Directories are never oplocked.
pub fn grant_level(inner: &StateInner, requested: bool, directory: bool) -> OplockLevel {
    if !requested || directory || inner.breaking.is_some() {
        return OplockLevel::None;
    }
    if inner.openers.is_empty() {
        return OplockLevel::Batch;
    }
    if inner.oplock.is_none() {
        return OplockLevel::LevelII;
    }
    OplockLevel::None
}

/// Builds the unsolicited break frame sent to an oplock holder.
pub fn build_break_frame(tid: u16, uid: u16, fid: u16, to_level: OplockLevel) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    let header = Header::unsolicited(Command::LockingAndX, tid, uid);
    // Infallible: the builder only fails on exhausted capacity at finish.
    let mut reply = match ReplyBuilder::new(&mut buf, header) {
        Ok(reply) => reply,
        Err(_) => unreachable!("break frame header serialization"),
    };
    reply.begin(8);
    reply.andx_slot();
    reply.u16(fid);
    reply.u8(lock_type::OPLOCK_RELEASE);
    reply.u8(if to_level == OplockLevel::LevelII { 1 } else { 0 });
    reply.u32(0); // timeout
    reply.u16(0); // unlock ranges
    reply.u16(0); // lock ranges
    reply.begin_bytes();
    reply.finish_block();
    let _ = reply.finish();
    buf
}

enum BreakStep {
    /// No incompatible oplock; the open may proceed.
    Proceed,
    /// A break is already pending; wait for it.
    Wait { since: Instant },
    /// This caller initiates the break to the exclusive holder.
    Send { holder: OplockOwner, to_level: OplockLevel },
}

/// Makes the entry's oplocks compatible with a new open, breaking and
/// waiting as needed. `wants_write` selects break-to-NONE over
/// break-to-LEVEL_II. Returns once the open may proceed.
pub async fn break_for_open(state: &Arc<FileState>, wants_write: bool, patience: Duration) {
    loop {
        let step = state.locked(|inner| {
            if let Some(pending) = &inner.breaking {
                if pending.since.elapsed() >= patience {
                    // Holder never answered: force the oplock away.
                    warn!(key = ?state.key, "oplock break timed out; forcing clear");
                    inner.oplock = None;
                    inner.breaking = None;
                    return BreakStep::Proceed;
                }
                return BreakStep::Wait { since: pending.since };
            }
            if let Some(holder) = &inner.oplock {
                let to_level =
                    if wants_write { OplockLevel::None } else { OplockLevel::LevelII };
                // Snapshot the holder once, inside the critical section; the
                // frame is built from the snapshot after the lock drops.
                let holder = holder.clone();
                inner.breaking = Some(PendingBreak { to_level, since: Instant::now() });
                return BreakStep::Send { holder, to_level };
            }
            if wants_write && !inner.level_ii.is_empty() {
                // Level-II holders break to none without acknowledgement.
                let holders = std::mem::take(&mut inner.level_ii);
                for holder in &holders {
                    let frame =
                        build_break_frame(holder.tid, holder.uid, holder.fid, OplockLevel::None);
                    let _ = holder.sender.send(Outgoing::Owned(frame));
                }
            }
            BreakStep::Proceed
        });

        match step {
            BreakStep::Proceed => return,
            BreakStep::Send { holder, to_level } => {
                debug!(key = ?state.key, fid = holder.fid, ?to_level, "oplock break sent");
                let frame = build_break_frame(holder.tid, holder.uid, holder.fid, to_level);
                if holder.sender.send(Outgoing::Owned(frame)).is_err() {
                    // Holder's connection is gone; treat as acknowledged.
                    state.locked(|inner| {
                        inner.oplock = None;
                        inner.breaking = None;
                    });
                    state.notify_break_done();
                    return;
                }
                wait_for_break(state, Instant::now(), patience).await;
            }
            BreakStep::Wait { since } => {
                wait_for_break(state, since, patience).await;
            }
        }
    }
}

async fn wait_for_break(state: &Arc<FileState>, since: Instant, patience: Duration) {
    let remaining = patience.saturating_sub(since.elapsed());
    if remaining.is_zero() {
        return;
    }
    let _ = tokio::time::timeout(remaining, state.break_done().notified()).await;
}

/// Applies a holder's break acknowledgement: the holder keeps LEVEL_II when
/// both sides agree on it, otherwise the oplock clears entirely. Returns
/// the level the holder ended up with.
pub fn apply_break_ack(state: &Arc<FileState>, connection: u64, fid: u16, new_level: OplockLevel)
    -> OplockLevel {
    let outcome = state.locked(|inner| {
        let Some(holder) = inner.oplock.clone() else {
            inner.breaking = None;
            return OplockLevel::None;
        };
        if holder.connection != connection || holder.fid != fid {
            // An ack from someone who is not the holder changes nothing.
            return holder.level;
        }
        let target = inner.breaking.as_ref().map(|b| b.to_level).unwrap_or(OplockLevel::None);
        inner.breaking = None;
        if target == OplockLevel::LevelII && new_level == OplockLevel::LevelII {
            let mut downgraded = holder;
            downgraded.level = OplockLevel::LevelII;
            inner.level_ii.push(downgraded);
            inner.oplock = None;
            OplockLevel::LevelII
        } else {
            inner.oplock = None;
            OplockLevel::None
        }
    });
    state.notify_break_done();
    outcome
}

/// Records a freshly granted oplock on the entry.
pub fn record_grant(inner: &mut StateInner, owner: OplockOwner) {
    match owner.level {
        OplockLevel::None => {}
        OplockLevel::LevelII => inner.level_ii.push(owner),
        OplockLevel::Exclusive | OplockLevel::Batch => inner.oplock = Some(owner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet;
    use crate::message_types::create_outgoing_channel;
    use crate::state::StateKey;

    fn entry() -> Arc<FileState> {
        Arc::new(FileState::new(StateKey::new(0, "\\exclusive.dat")))
    }

    fn holder(fid: u16, level: OplockLevel) -> (OplockOwner, crate::message_types::OutgoingReceiver)
    {
        let (tx, rx) = create_outgoing_channel();
        (OplockOwner { connection: 1, uid: 100, tid: 1, fid, level, sender: tx }, rx)
    }

    #[test]
    fn sole_opener_gets_batch() {
        let state = entry();
        state.locked(|inner| {
            assert_eq!(grant_level(inner, true, false), OplockLevel::Batch);
            assert_eq!(grant_level(inner, false, false), OplockLevel::None);
            assert_eq!(grant_level(inner, true, true), OplockLevel::None);
        });
    }

    #[test]
    fn break_frame_shape() {
        let frame = build_break_frame(0, 100, 7, OplockLevel::LevelII);
        let (header, body) = packet::parse(&frame).unwrap();
        assert_eq!(header.known_command(), Some(Command::LockingAndX));
        assert_eq!(header.mid, 0xFFFF);
        let mut words = body.words();
        crate::codec::primitive::u32(&mut words).unwrap(); // andx preamble
        assert_eq!(crate::codec::primitive::u16(&mut words).unwrap(), 7);
        assert_eq!(crate::codec::primitive::u8(&mut words).unwrap(), lock_type::OPLOCK_RELEASE);
        assert_eq!(crate::codec::primitive::u8(&mut words).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn break_waits_for_ack_then_proceeds() {
        let state = entry();
        let (owner, mut inbox) = holder(7, OplockLevel::Batch);
        state.locked(|inner| record_grant(inner, owner));

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                break_for_open(&state, false, Duration::from_secs(35)).await;
            })
        };
        tokio::task::yield_now().await;
        // the break frame went to the holder's connection
        assert!(inbox.recv().await.is_some());

        let level = apply_break_ack(&state, 1, 7, OplockLevel::LevelII);
        assert_eq!(level, OplockLevel::LevelII);
        waiter.await.unwrap();
        state.locked(|inner| {
            assert!(inner.oplock.is_none());
            assert_eq!(inner.level_ii.len(), 1);
            assert!(inner.breaking.is_none());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_break_is_forced_after_timeout() {
        let state = entry();
        let (owner, _inbox) = holder(9, OplockLevel::Exclusive);
        state.locked(|inner| record_grant(inner, owner));

        break_for_open(&state, true, Duration::from_secs(35)).await;
        state.locked(|inner| {
            assert!(inner.oplock.is_none());
            assert!(inner.breaking.is_none());
        });
    }

    #[tokio::test]
    async fn level_ii_holders_break_to_none_without_ack() {
        let state = entry();
        let (owner, mut inbox) = holder(3, OplockLevel::LevelII);
        state.locked(|inner| record_grant(inner, owner));

        break_for_open(&state, true, Duration::from_secs(1)).await;
        assert!(inbox.recv().await.is_some());
        state.locked(|inner| assert!(inner.level_ii.is_empty()));
    }
}
