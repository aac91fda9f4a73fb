//! The rolling `agent.status` file: pipe-delimited slots recording
//! resource kills, crashes and restarts, each with an effective window.

use std::collections::BTreeMap;
use std::path::PathBuf;

use skywatch_common::clock::ClockSource;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusKind {
    Resource = 1,
    CoreDump = 2,
    Start = 3,
}

impl StatusKind {
    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(StatusKind::Resource),
            2 => Some(StatusKind::CoreDump),
            3 => Some(StatusKind::Start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    epoch_seconds: u64,
    count: u32,
}

/// Counts age out after this long without a new event.
const EFFECTIVE_WINDOW_SECS: u64 = 24 * 60 * 60;

pub struct AgentStatus {
    path: PathBuf,
    clock: ClockSource,
    slots: BTreeMap<u32, Slot>,
}

impl AgentStatus {
    pub fn load(path: PathBuf, clock: ClockSource) -> Self {
        let mut slots = BTreeMap::new();
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                let mut parts = line.split('|');
                let (Some(tag), Some(ts), Some(count)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                let (Ok(tag), Ok(ts), Ok(count)) =
                    (tag.parse::<u32>(), ts.parse::<u64>(), count.parse::<u32>())
                else {
                    continue;
                };
                if StatusKind::from_tag(tag).is_some() {
                    slots.insert(
                        tag,
                        Slot {
                            epoch_seconds: ts,
                            count,
                        },
                    );
                }
            }
        }
        Self { path, clock, slots }
    }

    /// Record one event; the count restarts when the previous event fell
    /// outside the effective window.
    pub fn update(&mut self, kind: StatusKind) {
        let now = self.clock.epoch_seconds();
        let slot = self.slots.entry(kind as u32).or_default();
        if now.saturating_sub(slot.epoch_seconds) > EFFECTIVE_WINDOW_SECS {
            slot.count = 0;
        }
        slot.count += 1;
        slot.epoch_seconds = now;
        self.save();
    }

    /// The current in-window count for `kind`.
    pub fn get(&self, kind: StatusKind) -> u32 {
        let now = self.clock.epoch_seconds();
        match self.slots.get(&(kind as u32)) {
            Some(slot) if now.saturating_sub(slot.epoch_seconds) <= EFFECTIVE_WINDOW_SECS => {
                slot.count
            }
            _ => 0,
        }
    }

    fn save(&self) {
        let mut out = String::new();
        for (tag, slot) in &self.slots {
            out.push_str(&format!("{tag}|{}|{}\n", slot.epoch_seconds, slot.count));
        }
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, out) {
            warn!("writing {}: {e}", self.path.display());
        }
    }
}
