//! Filter stage.
//!
//! Applies the proxy's filter assignments as a sequential include/exclude
//! rewrite, channels first, then programs restricted to surviving channels.
//! Output order always matches input order: the rewrite computes a membership
//! set and the final sequence is produced by scanning the original input.

use crate::expression_parser::{ExpressionParser, channel_fields, program_fields};
use crate::models::{
    Channel, ConditionNode, ConditionTree, EpgProgram, FilterAction, FilterOperator,
    FilterSourceType, LogicalOperator, ProxyFilter,
};
use crate::pipeline::artifacts::{ArtifactType, PipelineArtifact};
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, StageResult};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which record kind a filter selects over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterTarget {
    Channel,
    Program,
}

/// A filter assignment that survived the load-time skip rules.
#[derive(Debug, Clone)]
struct LoadedFilter {
    id: String,
    name: String,
    target: FilterTarget,
    action: FilterAction,
    expression: String,
}

/// A loaded filter whose expression compiled to a condition tree.
#[derive(Debug)]
struct CompiledFilter {
    id: String,
    name: String,
    target: FilterTarget,
    action: FilterAction,
    tree: ConditionTree,
}

#[derive(Default)]
pub struct FilteringStage;

impl FilteringStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PipelineStage for FilteringStage {
    fn stage_id(&self) -> &'static str {
        "filtering"
    }

    fn stage_name(&self) -> &'static str {
        "Filtering"
    }

    async fn execute(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError> {
        let stage_start = Instant::now();
        let input_channels = state.channels.len();
        let input_programs = state.programs.len();

        let loaded = load_filters(&state.proxy.filters);
        if loaded.is_empty() {
            info!("No filters assigned to proxy {}, passing through", state.proxy_id);
            return Ok(StageResult {
                records_processed: input_channels + input_programs,
                duration: stage_start.elapsed(),
                message: "No filters assigned to proxy".to_string(),
                ..Default::default()
            });
        }

        let compiled = compile_filters(&loaded).map_err(|e| {
            PipelineError::stage_error(self.stage_id(), self.stage_name(), e)
        })?;
        debug!(
            "Filter compilation assigned={} compiled={}",
            loaded.len(),
            compiled.len()
        );

        // Channels first. A target with no assigned filters passes through;
        // assigned-but-compiled-away expressions leave an include-less
        // sequence whose output is empty.
        let channel_filters: Vec<&CompiledFilter> = compiled
            .iter()
            .filter(|f| f.target == FilterTarget::Channel)
            .collect();
        let channel_assigned = loaded.iter().any(|f| f.target == FilterTarget::Channel);

        let channels = std::mem::take(&mut state.channels);
        let kept_channels = if !channel_assigned {
            channels
        } else {
            let output = run_rewrite(&channels, &channel_filters, evaluate_channel, token)?;
            channels
                .into_iter()
                .enumerate()
                .filter(|(i, _)| output.contains(i))
                .map(|(_, c)| c)
                .collect()
        };

        // Programs are restricted to surviving channels before their own
        // filter sequence runs.
        let surviving_ids: HashSet<&str> = kept_channels
            .iter()
            .filter_map(|c| c.tvg_id.as_deref())
            .filter(|id| !id.is_empty())
            .collect();

        let programs = std::mem::take(&mut state.programs);
        let restricted: Vec<EpgProgram> = programs
            .into_iter()
            .filter(|p| surviving_ids.contains(p.channel_id.as_str()))
            .collect();

        let program_filters: Vec<&CompiledFilter> = compiled
            .iter()
            .filter(|f| f.target == FilterTarget::Program)
            .collect();
        let program_assigned = loaded.iter().any(|f| f.target == FilterTarget::Program);

        let kept_programs = if !program_assigned {
            restricted
        } else {
            let output = run_rewrite(&restricted, &program_filters, evaluate_program, token)?;
            restricted
                .into_iter()
                .enumerate()
                .filter(|(i, _)| output.contains(i))
                .map(|(_, p)| p)
                .collect()
        };

        let channels_removed = input_channels - kept_channels.len();
        let programs_removed = input_programs - kept_programs.len();
        let kept_channel_count = kept_channels.len();

        state.channels = kept_channels;
        state.programs = kept_programs;

        info!(
            "Filtering completed filters={} channels_kept={} channels_removed={} programs_kept={} programs_removed={} duration={}",
            compiled.len(),
            kept_channel_count,
            channels_removed,
            state.programs.len(),
            programs_removed,
            crate::utils::human_format::format_duration_precise(stage_start.elapsed())
        );

        let artifact = PipelineArtifact::new(ArtifactType::filtered_channels(), self.stage_id())
            .with_record_count(kept_channel_count)
            .with_metadata("channels_removed", serde_json::json!(channels_removed))
            .with_metadata("programs_removed", serde_json::json!(programs_removed));

        Ok(StageResult {
            artifacts: vec![artifact],
            records_processed: input_channels + input_programs,
            records_modified: channels_removed + programs_removed,
            duration: stage_start.elapsed(),
            message: format!(
                "Applied {} filters: {} channels removed, {} programs removed",
                compiled.len(),
                channels_removed,
                programs_removed
            ),
        })
    }
}

/// Apply the load-time skip rules and return surviving assignments in
/// ascending priority order.
fn load_filters(assignments: &[ProxyFilter]) -> Vec<LoadedFilter> {
    let mut sorted = assignments.to_vec();
    sorted.sort_by_key(|a| a.priority);

    let mut loaded = Vec::new();
    for assignment in &sorted {
        if assignment.is_active == Some(false) {
            debug!("Skipping inactive filter assignment {}", assignment.id);
            continue;
        }
        let Some(filter) = &assignment.filter else {
            debug!("Skipping assignment {} with missing filter", assignment.id);
            continue;
        };
        if !filter.is_enabled {
            debug!("Skipping disabled filter {}", filter.name);
            continue;
        }
        let target = match filter.source_type {
            FilterSourceType::Stream => FilterTarget::Channel,
            FilterSourceType::Epg => FilterTarget::Program,
            FilterSourceType::Unknown => {
                warn!("Skipping filter {} with unknown source type", filter.name);
                continue;
            }
        };
        if filter.action == FilterAction::Unknown {
            warn!("Skipping filter {} with unknown action", filter.name);
            continue;
        }
        loaded.push(LoadedFilter {
            id: filter.id.clone(),
            name: filter.name.clone(),
            target,
            action: filter.action,
            expression: filter.expression.clone(),
        });
    }
    loaded
}

/// Compile loaded filters, silently skipping empty expressions. A parse
/// failure fails the stage.
fn compile_filters(loaded: &[LoadedFilter]) -> anyhow::Result<Vec<CompiledFilter>> {
    let channel_parser = ExpressionParser::new().with_fields(channel_fields());
    let program_parser = ExpressionParser::new().with_fields(program_fields());

    let mut compiled = Vec::new();
    for filter in loaded {
        let parser = match filter.target {
            FilterTarget::Channel => &channel_parser,
            FilterTarget::Program => &program_parser,
        };
        let tree = parser
            .parse(&filter.expression)
            .map_err(|e| anyhow::anyhow!("filter '{}': {e}", filter.name))?;
        let Some(tree) = tree else {
            debug!("Skipping filter {} with empty expression", filter.name);
            continue;
        };
        compiled.push(CompiledFilter {
            id: filter.id.clone(),
            name: filter.name.clone(),
            target: filter.target,
            action: filter.action,
            tree,
        });
    }
    Ok(compiled)
}

/// Sequential include/exclude rewrite over `input`, returning the surviving
/// index set. Cancellation is polled once per filter.
fn run_rewrite<T>(
    input: &[T],
    filters: &[&CompiledFilter],
    evaluate: fn(&ConditionNode, &T) -> anyhow::Result<bool>,
    token: &CancellationToken,
) -> Result<HashSet<usize>, PipelineError> {
    let mut output: HashSet<usize> = HashSet::new();

    for filter in filters {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let matches = |record: &T| match evaluate(&filter.tree.root, record) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Filter evaluation error filter_id={} filter_name={}: {}; treating as non-match",
                    filter.id, filter.name, e
                );
                false
            }
        };

        match filter.action {
            FilterAction::Include => {
                for (i, record) in input.iter().enumerate() {
                    if matches(record) {
                        output.insert(i);
                    }
                }
            }
            FilterAction::Exclude => {
                let to_remove: Vec<usize> = output
                    .iter()
                    .copied()
                    .filter(|&i| matches(&input[i]))
                    .collect();
                for i in to_remove {
                    output.remove(&i);
                }
            }
            FilterAction::Unknown => unreachable!("unknown actions are skipped at load time"),
        }
    }

    Ok(output)
}

fn evaluate_channel(node: &ConditionNode, channel: &Channel) -> anyhow::Result<bool> {
    evaluate_node(node, &|field| match field {
        "channel_name" => Some(channel.channel_name.clone()),
        "tvg_id" => channel.tvg_id.clone(),
        "tvg_name" => channel.tvg_name.clone(),
        "tvg_logo" => channel.tvg_logo.clone(),
        "group_title" => channel.group_title.clone(),
        "stream_url" => Some(channel.stream_url.clone()),
        _ => None,
    })
}

fn evaluate_program(node: &ConditionNode, program: &EpgProgram) -> anyhow::Result<bool> {
    evaluate_node(node, &|field| match field {
        "programme_title" => Some(program.title.clone()),
        "programme_description" => program.description.clone(),
        "programme_category" => program.category.clone(),
        "programme_start" => Some(program.start.timestamp().to_string()),
        "programme_stop" => Some(program.stop.timestamp().to_string()),
        _ => None,
    })
}

fn evaluate_node(
    node: &ConditionNode,
    resolve: &dyn Fn(&str) -> Option<String>,
) -> anyhow::Result<bool> {
    match node {
        ConditionNode::Condition {
            field,
            operator,
            value,
            case_sensitive,
        } => {
            // Absent optional fields compare as empty.
            let field_value = resolve(field).unwrap_or_default();
            evaluate_condition(&field_value, *operator, value, *case_sensitive)
        }
        ConditionNode::Group { operator, children } => {
            if children.is_empty() {
                return Ok(true);
            }
            let mut results = Vec::with_capacity(children.len());
            for child in children {
                results.push(evaluate_node(child, resolve)?);
            }
            Ok(match operator {
                LogicalOperator::And => results.iter().all(|&r| r),
                LogicalOperator::Or => results.iter().any(|&r| r),
            })
        }
    }
}

fn evaluate_condition(
    field_value: &str,
    operator: FilterOperator,
    value: &str,
    case_sensitive: bool,
) -> anyhow::Result<bool> {
    let (left, right) = if case_sensitive {
        (field_value.to_string(), value.to_string())
    } else {
        (field_value.to_lowercase(), value.to_lowercase())
    };

    let result = match operator {
        FilterOperator::Equals => left == right,
        FilterOperator::NotEquals => left != right,
        FilterOperator::Contains => left.contains(&right),
        FilterOperator::NotContains => !left.contains(&right),
        FilterOperator::StartsWith => left.starts_with(&right),
        FilterOperator::NotStartsWith => !left.starts_with(&right),
        FilterOperator::EndsWith => left.ends_with(&right),
        FilterOperator::NotEndsWith => !left.ends_with(&right),
        FilterOperator::Matches => regex_matches(value, field_value),
        FilterOperator::NotMatches => !regex_matches(value, field_value),
        FilterOperator::GreaterThan => compare_values(field_value, value) == std::cmp::Ordering::Greater,
        FilterOperator::LessThan => compare_values(field_value, value) == std::cmp::Ordering::Less,
        FilterOperator::GreaterThanOrEqual => {
            compare_values(field_value, value) != std::cmp::Ordering::Less
        }
        FilterOperator::LessThanOrEqual => {
            compare_values(field_value, value) != std::cmp::Ordering::Greater
        }
    };
    Ok(result)
}

/// Regex evaluation against the original (non-lowercased) field value. An
/// invalid pattern degrades to a substring check.
fn regex_matches(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(regex) => regex.is_match(text),
        Err(e) => {
            warn!(
                "Invalid regex pattern '{}': {}, falling back to substring contains",
                pattern, e
            );
            text.contains(pattern)
        }
    }
}

/// Numeric comparison when both sides parse, lexicographic otherwise.
fn compare_values(field_value: &str, compare_value: &str) -> std::cmp::Ordering {
    if let (Ok(a), Ok(b)) = (field_value.parse::<f64>(), compare_value.parse::<f64>()) {
        a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
    } else {
        field_value.cmp(compare_value)
    }
}
