//! Typed `sbatch` directive values and their rendering rules.

use std::time::Duration;

use indexmap::IndexMap;
use itertools::Itertools;

/// The documented `sbatch` flags, long name first followed by any short alias.
///
/// Long names use `_` in place of `-` so they can double as lookup keys for
/// configuration mappings; `-` is restored when the script is rendered.
///
/// See <https://slurm.schedmd.com/sbatch.html>.
pub(crate) const SBATCH_DIRECTIVES: &[&[&str]] = &[
    &["account", "A"],
    &["acctg_freq"],
    &["array", "a"],
    &["batch"],
    &["bb"],
    &["bbf"],
    &["begin", "b"],
    &["chdir", "D"],
    &["cluster_constraint"],
    &["clusters", "M"],
    &["comment"],
    &["constraint", "C"],
    &["container"],
    &["container_id"],
    &["contiguous"],
    &["core_spec", "S"],
    &["cores_per_socket"],
    &["cpu_freq"],
    &["cpus_per_gpu"],
    &["cpus_per_task", "c"],
    &["deadline"],
    &["delay_boot"],
    &["dependency", "d"],
    &["distribution", "m"],
    &["error", "e"],
    &["exclude", "x"],
    &["exclusive"],
    &["export"],
    &["export_file"],
    &["extra"],
    &["extra_node_info", "B"],
    &["get_user_env"],
    &["gid"],
    &["gpu_bind"],
    &["gpu_freq"],
    &["gpus", "G"],
    &["gpus_per_node"],
    &["gpus_per_socket"],
    &["gpus_per_task"],
    &["gres"],
    &["gres_flags"],
    &["hint"],
    &["hold", "H"],
    &["ignore_pbs"],
    &["input", "i"],
    &["job_name", "J"],
    &["kill_on_invalid_dep"],
    &["licenses", "L"],
    &["mail_type"],
    &["mail_user"],
    &["mcs_label"],
    &["mem"],
    &["mem_bind"],
    &["mem_per_cpu"],
    &["mem_per_gpu"],
    &["mincpus"],
    &["network"],
    &["nice"],
    &["no_kill", "k"],
    &["no_requeue"],
    &["nodefile", "F"],
    &["nodelist", "w"],
    &["nodes", "N"],
    &["ntasks", "n"],
    &["ntasks_per_core"],
    &["ntasks_per_gpu"],
    &["ntasks_per_node"],
    &["ntasks_per_socket"],
    &["open_mode"],
    &["output", "o"],
    &["overcommit", "O"],
    &["oversubscribe", "s"],
    &["partition", "p"],
    &["power"],
    &["prefer"],
    &["priority"],
    &["profile"],
    &["propagate"],
    &["qos", "q"],
    &["quiet", "Q"],
    &["reboot"],
    &["requeue"],
    &["reservation"],
    &["signal"],
    &["sockets_per_node"],
    &["spread_job"],
    &["switches"],
    &["test_only"],
    &["thread_spec"],
    &["threads_per_core"],
    &["time", "t"],
    &["time_min"],
    &["tmp"],
    &["tres_per_task"],
    &["uid"],
    &["use_min_nodes"],
    &["verbose", "v"],
    &["wait", "W"],
    &["wait_all_nodes"],
    &["wckey"],
    &["wrap"],
];

/// Determines whether a key names a documented `sbatch` flag.
pub(crate) fn is_known_directive(key: &str) -> bool {
    SBATCH_DIRECTIVES.iter().any(|names| names.contains(&key))
}

/// A value for a single `sbatch` directive.
///
/// Each variant has a fixed rendering into the directive line:
///
/// * strings pass through unchanged;
/// * ranges render as `start-(end-1)`, with `:step` appended when the step is
///   not 1;
/// * maps render as comma-joined `key:value` pairs (useful for dependency
///   specifications such as `after:65541,afterok:34987`);
/// * durations render as `D-HH:MM:SS`;
/// * lists render each element recursively, comma-joined;
/// * a `true` flag renders the bare directive and a `false` flag omits the
///   directive from the script entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveValue {
    /// A literal string.
    Str(String),
    /// An integer.
    Int(i64),
    /// A half-open integer range `[start, end)` with a step.
    Range {
        /// The inclusive start of the range.
        start: i64,
        /// The exclusive end of the range.
        end: i64,
        /// The step between elements.
        step: i64,
    },
    /// An ordered mapping of sub-arguments.
    Map(IndexMap<String, DirectiveValue>),
    /// A wall-clock duration.
    Duration(Duration),
    /// An ordered list of values.
    List(Vec<DirectiveValue>),
    /// A boolean flag.
    Flag(bool),
}

impl DirectiveValue {
    /// Renders the value as it appears in the directive line.
    ///
    /// Returns `None` for a `false` flag, which causes the whole directive to
    /// be omitted.
    pub(crate) fn render(&self) -> Option<String> {
        match self {
            Self::Str(value) => Some(value.trim().to_string()),
            Self::Int(value) => Some(value.to_string()),
            Self::Range { start, end, step } => {
                let mut rendered = format!("{start}-{stop}", stop = end - 1);
                if *step != 1 {
                    rendered.push_str(&format!(":{step}"));
                }
                Some(rendered)
            }
            Self::Map(entries) => Some(
                entries
                    .iter()
                    .map(|(key, value)| {
                        format!("{key}:{value}", value = value.render().unwrap_or_default())
                    })
                    .join(","),
            ),
            Self::Duration(value) => Some(format_walltime(*value)),
            Self::List(values) => Some(
                values
                    .iter()
                    .map(|value| value.render().unwrap_or_default())
                    .join(","),
            ),
            Self::Flag(true) => Some(String::new()),
            Self::Flag(false) => None,
        }
    }
}

impl From<&str> for DirectiveValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for DirectiveValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for DirectiveValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for DirectiveValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for DirectiveValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<Duration> for DirectiveValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl From<Vec<DirectiveValue>> for DirectiveValue {
    fn from(values: Vec<DirectiveValue>) -> Self {
        Self::List(values)
    }
}

/// Formats a duration as Slurm wall-clock time (`D-HH:MM:SS`).
fn format_walltime(value: Duration) -> String {
    let total = value.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn strings_pass_through() {
        assert_eq!(
            DirectiveValue::from("gpu:2").render().as_deref(),
            Some("gpu:2")
        );
    }

    #[test]
    fn ranges_render_inclusive_stop() {
        let value = DirectiveValue::Range {
            start: 3,
            end: 15,
            step: 1,
        };
        assert_eq!(value.render().as_deref(), Some("3-14"));
    }

    #[test]
    fn stepped_ranges_append_the_step() {
        let value = DirectiveValue::Range {
            start: 3,
            end: 15,
            step: 2,
        };
        assert_eq!(value.render().as_deref(), Some("3-14:2"));
    }

    #[test]
    fn maps_render_colon_pairs() {
        let mut entries = IndexMap::new();
        entries.insert("after".to_string(), DirectiveValue::Int(65541));
        entries.insert("afterok".to_string(), DirectiveValue::Int(34987));
        assert_eq!(
            DirectiveValue::Map(entries).render().as_deref(),
            Some("after:65541,afterok:34987")
        );
    }

    #[test]
    fn durations_render_as_walltime() {
        let value = DirectiveValue::from(Duration::from_secs(86_400 + 2 * 3_600 + 3 * 60 + 4));
        assert_eq!(value.render().as_deref(), Some("1-02:03:04"));
    }

    #[test]
    fn lists_render_recursively() {
        let value = DirectiveValue::List(vec![
            DirectiveValue::Int(1),
            DirectiveValue::from("two"),
            DirectiveValue::Range {
                start: 3,
                end: 5,
                step: 1,
            },
        ]);
        assert_eq!(value.render().as_deref(), Some("1,two,3-4"));
    }

    #[test]
    fn false_flags_render_nothing() {
        assert_eq!(DirectiveValue::Flag(false).render(), None);
        assert_eq!(DirectiveValue::Flag(true).render().as_deref(), Some(""));
    }

    #[test]
    fn directive_lookup_accepts_long_and_short_names() {
        assert!(is_known_directive("cpus_per_task"));
        assert!(is_known_directive("c"));
        assert!(!is_known_directive("not_a_flag"));
    }
}
