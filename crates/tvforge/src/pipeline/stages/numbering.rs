//! Channel numbering stage.
//!
//! Assigns channel numbers according to the proxy's configured mode:
//!
//! - `sequential` renumbers every channel from the starting number in current
//!   order;
//! - `preserve` keeps pre-set numbers where possible, resolving collisions by
//!   incrementing to the next free number, then fills unnumbered channels from
//!   a pool of available numbers;
//! - `group` partitions channels by group title and gives each group its own
//!   contiguous band.
//!
//! Every execution resets and repopulates the conflict log, which callers can
//! inspect through [`NumberingStage::conflicts`].

use crate::models::{Channel, NumberingMode};
use crate::pipeline::artifacts::{ArtifactType, PipelineArtifact};
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, StageResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Band width used for group numbering when the proxy does not set one.
const DEFAULT_GROUP_SIZE: u32 = 100;
/// Group title applied to channels without one.
const UNCATEGORIZED_GROUP: &str = "Uncategorized";

/// Record of a preset number that had to move during preserve-mode assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberingConflict {
    pub channel_name: String,
    pub original_number: u32,
    pub assigned_number: u32,
}

#[derive(Default)]
pub struct NumberingStage {
    conflicts: Vec<NumberingConflict>,
}

impl NumberingStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conflicts recorded by the most recent execution.
    pub fn conflicts(&self) -> &[NumberingConflict] {
        &self.conflicts
    }

    /// Two-pass preserve assignment. Pass one walks channels in order and
    /// claims each pre-set number, incrementing past already-claimed values;
    /// pass two assigns queued unnumbered channels from the available pool.
    fn apply_preserve(&mut self, channels: &mut [Channel], start: u32) -> usize {
        let mut claimed: HashSet<u32> = HashSet::new();
        let mut queued: Vec<usize> = Vec::new();
        let mut modified = 0usize;

        for (idx, channel) in channels.iter_mut().enumerate() {
            if channel.channel_number == 0 {
                queued.push(idx);
                continue;
            }
            let original = channel.channel_number;
            let mut candidate = original;
            while claimed.contains(&candidate) {
                candidate += 1;
            }
            claimed.insert(candidate);
            if candidate != original {
                warn!(
                    "Channel number conflict: '{}' wanted {} and was assigned {}",
                    channel.channel_name, original, candidate
                );
                self.conflicts.push(NumberingConflict {
                    channel_name: channel.channel_name.clone(),
                    original_number: original,
                    assigned_number: candidate,
                });
                channel.channel_number = candidate;
                modified += 1;
            }
        }

        // Pool of available numbers from the starting number upward, skipping
        // claimed values, sized to the queue.
        let mut pool: Vec<u32> = Vec::with_capacity(queued.len());
        let mut candidate = start;
        while pool.len() < queued.len() {
            if !claimed.contains(&candidate) {
                pool.push(candidate);
            }
            candidate += 1;
        }

        for (pool_slot, idx) in queued.iter().enumerate() {
            let number = pool[pool_slot];
            channels[*idx].channel_number = number;
            claimed.insert(number);
            modified += 1;
        }

        modified
    }

    fn apply_sequential(channels: &mut [Channel], start: u32) -> usize {
        for (offset, channel) in channels.iter_mut().enumerate() {
            channel.channel_number = start + offset as u32;
        }
        channels.len()
    }

    /// Group-banded assignment: groups sorted lexicographically, group *i*
    /// occupying `[start + i*size, start + (i+1)*size)`, channels ascending in
    /// first-seen order within each band.
    fn apply_group(channels: &mut [Channel], start: u32, size: u32) -> usize {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, channel) in channels.iter().enumerate() {
            let group = channel
                .group_title
                .as_deref()
                .filter(|g| !g.is_empty())
                .unwrap_or(UNCATEGORIZED_GROUP)
                .to_string();
            groups.entry(group).or_default().push(idx);
        }

        let mut modified = 0usize;
        for (band, (group, members)) in groups.iter().enumerate() {
            if members.len() as u32 > size {
                warn!(
                    "Group '{}' has {} channels, exceeding its band size {}",
                    group,
                    members.len(),
                    size
                );
            }
            let base = start + band as u32 * size;
            for (offset, idx) in members.iter().enumerate() {
                channels[*idx].channel_number = base + offset as u32;
                modified += 1;
            }
        }
        modified
    }
}

#[async_trait]
impl PipelineStage for NumberingStage {
    fn stage_id(&self) -> &'static str {
        "numbering"
    }

    fn stage_name(&self) -> &'static str {
        "Numbering"
    }

    async fn execute(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError> {
        let stage_start = Instant::now();
        self.conflicts.clear();

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mode = state.proxy.numbering_mode.unwrap_or(NumberingMode::Preserve);
        let start = state.proxy.starting_channel_number.max(1);
        let size = if state.proxy.group_numbering_size > 0 {
            state.proxy.group_numbering_size
        } else {
            DEFAULT_GROUP_SIZE
        };

        let total = state.channels.len();
        let modified = match mode {
            NumberingMode::Sequential => Self::apply_sequential(&mut state.channels, start),
            NumberingMode::Preserve => self.apply_preserve(&mut state.channels, start),
            NumberingMode::Group => Self::apply_group(&mut state.channels, start, size),
            NumberingMode::Unknown => {
                warn!("Unknown numbering mode configured, falling back to sequential");
                Self::apply_sequential(&mut state.channels, start)
            }
        };

        debug!(
            "Numbering assignment mode={} start={} group_size={} channels={}",
            mode, start, size, total
        );
        info!(
            "Numbering completed mode={} channels={} modified={} conflicts_resolved={} duration={}",
            mode,
            total,
            modified,
            self.conflicts.len(),
            crate::utils::human_format::format_duration_precise(stage_start.elapsed())
        );

        let artifact = PipelineArtifact::new(ArtifactType::numbered_channels(), self.stage_id())
            .with_record_count(total)
            .with_metadata("starting_number", serde_json::json!(start))
            .with_metadata("mode", serde_json::json!(mode.to_string()))
            .with_metadata("conflicts_resolved", serde_json::json!(self.conflicts.len()));

        Ok(StageResult {
            artifacts: vec![artifact],
            records_processed: total,
            records_modified: modified,
            duration: stage_start.elapsed(),
            message: format!(
                "Assigned numbers to {total} channels in {mode} mode ({} conflicts resolved)",
                self.conflicts.len()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Proxy;
    use std::path::PathBuf;

    fn channel(name: &str, number: u32, group: Option<&str>) -> Channel {
        Channel {
            channel_name: name.to_string(),
            stream_url: format!("http://example.com/{name}"),
            group_title: group.map(str::to_string),
            channel_number: number,
            ..Default::default()
        }
    }

    fn state_with(
        channels: Vec<Channel>,
        mode: Option<NumberingMode>,
        start: u32,
        group_size: u32,
    ) -> PipelineState {
        let proxy = Proxy {
            id: "01JGME8BKRTZQ0YVB7NP3XH2DA".to_string(),
            name: "test".to_string(),
            sources: vec![],
            epg_sources: vec![],
            filters: vec![],
            output_path: None,
            starting_channel_number: start,
            numbering_mode: mode,
            group_numbering_size: group_size,
            cache_channel_logos: false,
            cache_program_logos: false,
        };
        let mut state =
            PipelineState::new(proxy, PathBuf::from("/tmp/run"), PathBuf::from("/tmp/out"));
        state.channels = channels;
        state
    }

    fn numbers(state: &PipelineState) -> Vec<u32> {
        state.channels.iter().map(|c| c.channel_number).collect()
    }

    #[tokio::test]
    async fn sequential_renumbers_everything() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![
                channel("A", 7, None),
                channel("B", 0, None),
                channel("C", 3, None),
            ],
            Some(NumberingMode::Sequential),
            10,
            0,
        );
        let result = stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(numbers(&state), vec![10, 11, 12]);
        assert_eq!(result.records_modified, 3);
    }

    #[tokio::test]
    async fn preserve_resolves_conflicts_by_incrementing() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![
                channel("A", 5, None),
                channel("B", 5, None),
                channel("C", 5, None),
                channel("D", 10, None),
            ],
            Some(NumberingMode::Preserve),
            1,
            0,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(numbers(&state), vec![5, 6, 7, 10]);
        assert_eq!(stage.conflicts().len(), 2);
        assert_eq!(
            stage.conflicts()[0],
            NumberingConflict {
                channel_name: "B".to_string(),
                original_number: 5,
                assigned_number: 6,
            }
        );
    }

    #[tokio::test]
    async fn preserve_fills_unnumbered_from_pool_skipping_claimed() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![
                channel("Preset", 2, None),
                channel("First fill", 0, None),
                channel("Second fill", 0, None),
            ],
            Some(NumberingMode::Preserve),
            1,
            0,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        // Pool starts at 1 and skips the claimed 2.
        assert_eq!(numbers(&state), vec![2, 1, 3]);
        assert!(stage.conflicts().is_empty());
    }

    #[tokio::test]
    async fn preserve_produces_unique_positive_numbers() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![
                channel("A", 1, None),
                channel("B", 1, None),
                channel("C", 0, None),
                channel("D", 2, None),
                channel("E", 0, None),
            ],
            Some(NumberingMode::Preserve),
            1,
            0,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        let nums = numbers(&state);
        let unique: HashSet<_> = nums.iter().copied().collect();
        assert_eq!(unique.len(), nums.len());
        assert!(nums.iter().all(|&n| n > 0));
    }

    #[tokio::test]
    async fn preserve_is_the_default_mode() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(vec![channel("A", 42, None)], None, 1, 0);
        let result = stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(numbers(&state), vec![42]);
        assert_eq!(result.artifacts[0].metadata["mode"], "preserve");
    }

    #[tokio::test]
    async fn unknown_mode_falls_back_to_sequential() {
        let mut stage = NumberingStage::new();
        // A stored mode string outside the known set deserializes to Unknown.
        let mode: NumberingMode = serde_json::from_str("\"alphabetical\"").unwrap();
        let mut state = state_with(
            vec![channel("A", 7, None), channel("B", 0, None)],
            Some(mode),
            5,
            0,
        );
        let result = stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(numbers(&state), vec![5, 6]);
        assert_eq!(result.records_modified, 2);
    }

    #[tokio::test]
    async fn group_mode_assigns_lexicographic_bands() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![
                channel("Sports 1", 0, Some("Sports")),
                channel("Sports 2", 0, Some("Sports")),
                channel("News 1", 0, Some("News")),
                channel("Movie 1", 0, Some("Movies")),
            ],
            Some(NumberingMode::Group),
            100,
            100,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        // Movies < News < Sports lexicographically.
        assert_eq!(numbers(&state), vec![300, 301, 200, 100]);
    }

    #[tokio::test]
    async fn group_mode_buckets_empty_groups_as_uncategorized() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![
                channel("Anon", 0, None),
                channel("Blank", 0, Some("")),
                channel("Sports 1", 0, Some("Sports")),
            ],
            Some(NumberingMode::Group),
            1,
            50,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        // "Sports" < "Uncategorized"; the two unlabelled channels share a band.
        assert_eq!(numbers(&state), vec![51, 52, 1]);
    }

    #[tokio::test]
    async fn zero_starting_number_is_treated_as_one() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![channel("A", 0, None)],
            Some(NumberingMode::Sequential),
            0,
            0,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(numbers(&state), vec![1]);
    }

    #[tokio::test]
    async fn conflict_log_resets_between_executions() {
        let mut stage = NumberingStage::new();
        let mut state = state_with(
            vec![channel("A", 5, None), channel("B", 5, None)],
            Some(NumberingMode::Preserve),
            1,
            0,
        );
        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(stage.conflicts().len(), 1);

        let mut clean = state_with(
            vec![channel("A", 1, None)],
            Some(NumberingMode::Preserve),
            1,
            0,
        );
        stage
            .execute(&CancellationToken::new(), &mut clean)
            .await
            .unwrap();
        assert!(stage.conflicts().is_empty());
    }
}
