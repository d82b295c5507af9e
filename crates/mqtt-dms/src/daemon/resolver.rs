//! Topic to command mapping.
//!
//! Each subscribed topic is described by up to three configuration keys:
//!
//! - `<topic>.cmd` - long-running program to start (or a web page to open)
//! - `<topic>.killCmd` - command stopping that program again
//! - `<topic>.exec` - fire-and-forget command

use crate::config::Properties;
use crate::daemon::supervisor::ActionSpec;
use std::collections::BTreeSet;

pub const START_SUFFIX: &str = ".cmd";
pub const KILL_SUFFIX: &str = ".killCmd";
pub const EXEC_SUFFIX: &str = ".exec";

/// Strip a recognised command suffix from a configuration key.
pub fn topic_of(key: &str) -> Option<&str> {
    [START_SUFFIX, KILL_SUFFIX, EXEC_SUFFIX]
        .iter()
        .find_map(|suffix| key.strip_suffix(suffix))
        .filter(|topic| !topic.is_empty())
}

/// Resolves topics to [`ActionSpec`]s. Built once at startup.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    props: Properties,
    subscriptions: Vec<String>,
}

impl CommandResolver {
    pub fn new(props: Properties, topic_prefix: &str) -> Self {
        let mut topics = BTreeSet::new();
        for key in props.keys().filter(|k| k.starts_with(topic_prefix)) {
            match topic_of(key) {
                Some(topic) => {
                    topics.insert(topic.to_string());
                }
                None => log::warn!(
                    "Ignoring config property {}: expected a {}, {} or {} suffix",
                    key,
                    START_SUFFIX,
                    KILL_SUFFIX,
                    EXEC_SUFFIX
                ),
            }
        }

        Self {
            props,
            subscriptions: topics.into_iter().collect(),
        }
    }

    /// Ordered, de-duplicated topics to subscribe to
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Configuration key for a topic. Topics are used as keys directly.
    pub fn action_key<'a>(&self, topic: &'a str) -> &'a str {
        topic
    }

    /// Commands configured for `key`; missing entries are empty.
    pub fn lookup(&self, key: &str) -> ActionSpec {
        let get = |suffix: &str| {
            self.props
                .get(&format!("{key}{suffix}"))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        ActionSpec {
            start_command: get(START_SUFFIX),
            kill_command: get(KILL_SUFFIX),
            exec_command: get(EXEC_SUFFIX),
        }
    }
}
