//! Deterministic reconciliation of a record both histories changed.
//!
//! Records are independent files, so a conflict is always one path with two
//! candidate versions. The policy only looks at the candidates themselves, so
//! any machine resolving the same pair reaches the same bytes.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskvault_core::models::{parse_timestamp, ts_micros};

/// One side's version of a conflicting path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Present {
        bytes: Vec<u8>,
        stamp: Option<DateTime<Utc>>,
    },
    Deleted {
        at: Option<DateTime<Utc>>,
    },
}

impl Candidate {
    /// A present version, stamped from its `updated_at` (or `created_at`).
    #[must_use]
    pub fn present(bytes: Vec<u8>) -> Self {
        let stamp = record_stamp(&bytes);
        Self::Present { bytes, stamp }
    }

    #[must_use]
    pub const fn deleted(at: Option<DateTime<Utc>>) -> Self {
        Self::Deleted { at }
    }

    const fn stamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Present { stamp, .. } => *stamp,
            Self::Deleted { at } => *at,
        }
    }

    fn into_content(self) -> Option<Vec<u8>> {
        match self {
            Self::Present { bytes, .. } => Some(bytes),
            Self::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// Both sides updated; the strictly later `updated_at` won.
    NewerWins,
    /// One side deleted; the update was not strictly later than the deletion.
    DeletionWins,
    /// One side deleted; the update was strictly later and brings it back.
    UpdateResurrects,
    /// Equal timestamps with different content; the greater bytes won.
    Tiebreak,
}

/// What a resolution kept and what it discarded, for the sync report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionNote {
    pub path: String,
    pub record_id: String,
    pub kind: ResolutionKind,
    pub winner: Side,
    pub discarded: Side,
    #[serde(with = "ts_micros::option")]
    pub kept_updated_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_micros::option")]
    pub discarded_updated_at: Option<DateTime<Utc>>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: String,
    /// Winning content; `None` means the path stays deleted.
    pub content: Option<Vec<u8>>,
    pub note: ResolutionNote,
}

/// Outcome of the three-way comparison of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    TakeLocal,
    TakeRemote,
    Conflict,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Three-way merge of one path against the common ancestor. Only a path
    /// both sides changed, to different results, is a conflict.
    #[must_use]
    pub fn classify(base: Option<&[u8]>, local: Option<&[u8]>, remote: Option<&[u8]>) -> Merge {
        if local == remote || remote == base {
            Merge::TakeLocal
        } else if local == base {
            Merge::TakeRemote
        } else {
            Merge::Conflict
        }
    }

    /// Pick the winner of a conflict. The result does not depend on which
    /// side is called local.
    #[must_use]
    pub fn resolve(&self, path: &str, local: Candidate, remote: Candidate) -> Resolution {
        let (winner, kind) = decide(&local, &remote);
        let (kept, dropped) = match winner {
            Side::Local => (local, remote),
            Side::Remote => (remote, local),
        };
        let discarded = match winner {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        };

        let note = ResolutionNote {
            path: path.to_string(),
            record_id: record_id_from_path(path),
            kind,
            winner,
            discarded,
            kept_updated_at: kept.stamp(),
            discarded_updated_at: dropped.stamp(),
            detail: describe(kind, winner, discarded, &kept, &dropped),
        };
        tracing::info!(
            path,
            kind = ?kind,
            winner = winner.as_str(),
            "[sync] resolved conflict"
        );

        Resolution {
            path: path.to_string(),
            content: kept.into_content(),
            note,
        }
    }
}

fn decide(local: &Candidate, remote: &Candidate) -> (Side, ResolutionKind) {
    match (local, remote) {
        (
            Candidate::Present {
                bytes: lb,
                stamp: ls,
            },
            Candidate::Present {
                bytes: rb,
                stamp: rs,
            },
        ) => match ls.cmp(rs) {
            // A missing stamp (None) orders below any known one.
            Ordering::Greater => (Side::Local, ResolutionKind::NewerWins),
            Ordering::Less => (Side::Remote, ResolutionKind::NewerWins),
            Ordering::Equal if lb >= rb => (Side::Local, ResolutionKind::Tiebreak),
            Ordering::Equal => (Side::Remote, ResolutionKind::Tiebreak),
        },
        (Candidate::Present { stamp, .. }, Candidate::Deleted { at }) => {
            if update_beats_deletion(*stamp, *at) {
                (Side::Local, ResolutionKind::UpdateResurrects)
            } else {
                (Side::Remote, ResolutionKind::DeletionWins)
            }
        }
        (Candidate::Deleted { at }, Candidate::Present { stamp, .. }) => {
            if update_beats_deletion(*stamp, *at) {
                (Side::Remote, ResolutionKind::UpdateResurrects)
            } else {
                (Side::Local, ResolutionKind::DeletionWins)
            }
        }
        // Not a conflict; classify() takes either side.
        (Candidate::Deleted { .. }, Candidate::Deleted { .. }) => {
            (Side::Local, ResolutionKind::DeletionWins)
        }
    }
}

/// The update wins only when both times are known and it is strictly later.
fn update_beats_deletion(update: Option<DateTime<Utc>>, deletion: Option<DateTime<Utc>>) -> bool {
    matches!((update, deletion), (Some(u), Some(d)) if u > d)
}

fn describe(
    kind: ResolutionKind,
    winner: Side,
    discarded: Side,
    kept: &Candidate,
    dropped: &Candidate,
) -> String {
    let when = |c: &Candidate| {
        c.stamp()
            .map_or_else(|| "an unknown time".to_string(), |t| t.to_rfc3339())
    };
    match kind {
        ResolutionKind::NewerWins => format!(
            "{} update at {} discarded; {} update at {} is newer",
            discarded.as_str(),
            when(dropped),
            winner.as_str(),
            when(kept)
        ),
        ResolutionKind::Tiebreak => format!(
            "{} update discarded; both sides updated at {}, content tiebreak kept {}",
            discarded.as_str(),
            when(kept),
            winner.as_str()
        ),
        ResolutionKind::DeletionWins => format!(
            "{} update at {} discarded; {} deleted the record at {}",
            discarded.as_str(),
            when(dropped),
            winner.as_str(),
            when(kept)
        ),
        ResolutionKind::UpdateResurrects => format!(
            "{} deletion at {} discarded; {} update at {} is later",
            discarded.as_str(),
            when(dropped),
            winner.as_str(),
            when(kept)
        ),
    }
}

/// Mutation stamp of a record file: `updated_at`, else `created_at`.
#[must_use]
pub fn record_stamp(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    ["updated_at", "created_at"]
        .iter()
        .find_map(|key| value.get(key).and_then(serde_json::Value::as_str))
        .and_then(parse_timestamp)
}

fn record_id_from_path(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".json").unwrap_or(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(micros: i64) -> DateTime<Utc> {
        Utc.timestamp_micros(1_780_000_000_000_000 + micros).unwrap()
    }

    fn record(status: &str, updated: DateTime<Utc>) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "t-1",
            "status": status,
            "created_at": "2026-01-01T00:00:00.000000Z",
            "updated_at": updated.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        }))
        .unwrap()
    }

    #[test]
    fn classify_three_way() {
        let (b, x, y) = (Some(&b"b"[..]), Some(&b"x"[..]), Some(&b"y"[..]));
        assert_eq!(ConflictResolver::classify(b, x, b), Merge::TakeLocal);
        assert_eq!(ConflictResolver::classify(b, b, y), Merge::TakeRemote);
        assert_eq!(ConflictResolver::classify(b, x, x), Merge::TakeLocal);
        assert_eq!(ConflictResolver::classify(b, x, y), Merge::Conflict);
        assert_eq!(ConflictResolver::classify(b, None, y), Merge::Conflict);
        assert_eq!(ConflictResolver::classify(None, x, None), Merge::TakeLocal);
        assert_eq!(ConflictResolver::classify(None, None, y), Merge::TakeRemote);
    }

    #[test]
    fn later_update_wins_and_notes_the_discard() {
        let resolver = ConflictResolver::new();
        let a = record("completed", at(1));
        let b = record("in_progress", at(2));
        let res = resolver.resolve(
            "tasks/t-1.json",
            Candidate::present(a),
            Candidate::present(b.clone()),
        );
        assert_eq!(res.content, Some(b));
        assert_eq!(res.note.kind, ResolutionKind::NewerWins);
        assert_eq!(res.note.winner, Side::Remote);
        assert_eq!(res.note.discarded, Side::Local);
        assert_eq!(res.note.record_id, "t-1");
        assert_eq!(res.note.discarded_updated_at, Some(at(1)));
        assert!(res.note.detail.starts_with("local update"));
    }

    #[test]
    fn deletion_wins_unless_update_is_strictly_later() {
        let resolver = ConflictResolver::new();
        let update = record("pending", at(5));

        let res = resolver.resolve(
            "tasks/t-1.json",
            Candidate::present(update.clone()),
            Candidate::deleted(Some(at(5))),
        );
        assert_eq!(res.content, None);
        assert_eq!(res.note.kind, ResolutionKind::DeletionWins);

        let res = resolver.resolve(
            "tasks/t-1.json",
            Candidate::deleted(Some(at(4))),
            Candidate::present(update.clone()),
        );
        assert_eq!(res.content, Some(update.clone()));
        assert_eq!(res.note.kind, ResolutionKind::UpdateResurrects);
        assert_eq!(res.note.winner, Side::Remote);

        // Unknown deletion time: deletion wins.
        let res = resolver.resolve(
            "tasks/t-1.json",
            Candidate::present(update),
            Candidate::deleted(None),
        );
        assert_eq!(res.content, None);
    }

    #[test]
    fn equal_stamps_use_content_tiebreak() {
        let resolver = ConflictResolver::new();
        let a = record("completed", at(3));
        let b = record("pending", at(3));
        let expected = a.clone().max(b.clone());
        let res = resolver.resolve("tasks/t-1.json", Candidate::present(a), Candidate::present(b));
        assert_eq!(res.note.kind, ResolutionKind::Tiebreak);
        assert_eq!(res.content, Some(expected));
    }

    #[test]
    fn unparseable_stamp_ranks_lowest() {
        let resolver = ConflictResolver::new();
        let good = record("pending", at(0));
        let res = resolver.resolve(
            "tasks/t-1.json",
            Candidate::present(b"not json".to_vec()),
            Candidate::present(good.clone()),
        );
        assert_eq!(res.content, Some(good));
    }

    #[test]
    fn stamp_falls_back_to_created_at() {
        let bytes = br#"{"created_at":"2026-01-01T00:00:00.000001Z"}"#;
        assert_eq!(
            record_stamp(bytes),
            parse_timestamp("2026-01-01T00:00:00.000001Z")
        );
    }

    fn candidate() -> impl Strategy<Value = Candidate> {
        prop_oneof![
            (prop::option::of(0i64..4), prop::collection::vec(any::<u8>(), 0..4)).prop_map(
                |(stamp, bytes)| Candidate::Present {
                    bytes,
                    stamp: stamp.map(at),
                }
            ),
            prop::option::of(0i64..4).prop_map(|t| Candidate::Deleted { at: t.map(at) }),
        ]
    }

    proptest! {
        #[test]
        fn resolution_is_independent_of_side(a in candidate(), b in candidate()) {
            let resolver = ConflictResolver::new();
            let ab = resolver.resolve("tasks/t-1.json", a.clone(), b.clone());
            let ba = resolver.resolve("tasks/t-1.json", b, a);
            prop_assert_eq!(ab.content, ba.content);
            prop_assert_eq!(ab.note.kind, ba.note.kind);
        }
    }
}
