//! Maps a task string and token budget onto an ordered list of layers to
//! admit. Pure function of the request and the current index snapshot; the
//! only data consulted are already-indexed sizes.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::{ConfigWarning, LoadingSettings, TriggerPriority, TriggerRule};
use crate::index::{IndexSnapshot, LayerId};

/// Why a requested layer was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Budget,
    Deadline,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Budget => "skipped:budget",
            SkipReason::Deadline => "skipped:deadline",
        }
    }
}

/// Selector output: the admitted layers in load order plus diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub admitted: Vec<LayerId>,
    pub skipped: Vec<(LayerId, SkipReason)>,
    /// Requested names that match nothing in the index (or are not valid
    /// layer ids). Surfaced as warnings, never errors.
    pub unknown: Vec<String>,
}

struct CompiledTrigger {
    regex: Regex,
    layers: Vec<LayerId>,
    priority: TriggerPriority,
}

pub struct Selector {
    default_layers: Vec<LayerId>,
    triggers: Vec<CompiledTrigger>,
    max_tokens: Option<u64>,
}

impl Selector {
    /// Compiles trigger rules once. Unparseable patterns and invalid layer
    /// ids are dropped with a warning, matching the config policy of never
    /// failing startup over bad optional input.
    pub fn from_settings(settings: &LoadingSettings) -> (Self, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();
        let default_layers = settings
            .default_layers
            .iter()
            .filter_map(|raw| match LayerId::new(raw) {
                Some(layer) => Some(layer),
                None => {
                    warnings.push(ConfigWarning::UnknownKey {
                        key: format!("loading.default_layers: `{raw}`"),
                    });
                    None
                }
            })
            .collect();

        let mut triggers = Vec::new();
        for (index, rule) in settings.triggers.iter().enumerate() {
            match compile_trigger(rule) {
                Ok(trigger) => triggers.push(trigger),
                Err(reason) => warnings.push(ConfigWarning::InvalidTrigger { index, reason }),
            }
        }

        (
            Self {
                default_layers,
                triggers,
                max_tokens: settings.max_tokens,
            },
            warnings,
        )
    }

    /// Chooses layers for one request.
    ///
    /// Order: default layers, then explicit layers as given, then triggered
    /// layers by priority (high > medium > low, stable within a priority).
    /// Duplicates collapse to their first occurrence. The token budget then
    /// admits a prefix: the first layer that would overflow, and everything
    /// after it, is `skipped:budget`.
    pub fn select(
        &self,
        task: Option<&str>,
        explicit: Option<&[String]>,
        budget: Option<u64>,
        snapshot: &IndexSnapshot,
    ) -> Selection {
        let mut selection = Selection::default();
        let mut candidates: Vec<LayerId> = Vec::new();
        let mut push = |layer: LayerId, candidates: &mut Vec<LayerId>| {
            if !candidates.contains(&layer) {
                candidates.push(layer);
            }
        };

        for layer in &self.default_layers {
            if snapshot.contains_layer(layer) {
                push(layer.clone(), &mut candidates);
            }
        }

        if let Some(requested) = explicit {
            if requested.iter().any(|raw| raw == "*") {
                for layer in snapshot.layer_ids() {
                    push(layer, &mut candidates);
                }
            }
            for raw in requested {
                if raw == "*" {
                    continue;
                }
                match LayerId::new(raw) {
                    Some(layer) if snapshot.contains_layer(&layer) => {
                        push(layer, &mut candidates)
                    }
                    _ => selection.unknown.push(raw.clone()),
                }
            }
        }

        if let Some(task) = task {
            let mut triggered: Vec<(TriggerPriority, usize, &LayerId)> = Vec::new();
            for (index, trigger) in self.triggers.iter().enumerate() {
                if trigger.regex.is_match(task) {
                    for layer in &trigger.layers {
                        triggered.push((trigger.priority, index, layer));
                    }
                }
            }
            // Priority first; insertion order breaks ties.
            triggered.sort_by_key(|(priority, index, _)| (*priority, *index));
            for (_, _, layer) in triggered {
                if snapshot.contains_layer(layer) {
                    push(layer.clone(), &mut candidates);
                } else {
                    debug!(layer = %layer, "trigger targets unindexed layer");
                }
            }
        }

        // A layer admits its whole subtree, so a nested candidate whose
        // parent is also selected would be served twice and double-charge
        // the budget. Keep the outermost of any overlapping pair.
        let candidates: Vec<LayerId> = candidates
            .iter()
            .filter(|layer| {
                !candidates
                    .iter()
                    .any(|other| other != *layer && layer.is_under(other))
            })
            .cloned()
            .collect();

        let budget = budget.or(self.max_tokens);
        let Some(budget) = budget else {
            selection.admitted = candidates;
            return selection;
        };

        // A layer is admitted while any budget remains when it starts; the
        // first layer reached with the budget already spent is excluded,
        // along with everything after it.
        let mut spent: u64 = 0;
        for layer in candidates {
            if spent >= budget {
                selection.skipped.push((layer, SkipReason::Budget));
                continue;
            }
            spent += snapshot.layer_token_estimate(&layer);
            selection.admitted.push(layer);
        }
        selection
    }
}

fn compile_trigger(rule: &TriggerRule) -> Result<CompiledTrigger, String> {
    let layers: Vec<LayerId> = rule
        .layers
        .iter()
        .filter_map(|raw| LayerId::new(raw))
        .collect();
    if layers.is_empty() {
        return Err("no valid target layers".to_string());
    }
    let pattern = match (&rule.pattern, rule.keywords.is_empty()) {
        (Some(pattern), _) => pattern.clone(),
        (None, false) => {
            let escaped: Vec<String> = rule
                .keywords
                .iter()
                .map(|keyword| format!(r"\b{}\b", regex::escape(keyword)))
                .collect();
            escaped.join("|")
        }
        (None, true) => return Err("neither pattern nor keywords".to_string()),
    };
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|error| format!("bad pattern: {error}"))?;
    Ok(CompiledTrigger {
        regex,
        layers,
        priority: rule.priority,
    })
}
