//! Environment variable helpers

use tracing::info;

/// Read a boolean environment flag
///
/// `1`, `true` and `yes` (case-insensitive) count as set.
pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let set = v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes");
            if set {
                info!("{} is set", name);
            }
            set
        }
        Err(_) => false,
    }
}

/// Read an enumerated environment variable, returning the index of the
/// matching choice or `default` when unset or unrecognized
pub fn env_choice(name: &str, choices: &[&str], default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => match choices.iter().position(|c| v.eq_ignore_ascii_case(c)) {
            Some(idx) => {
                info!("{}={}", name, choices[idx]);
                idx
            }
            None => {
                tracing::warn!("Unknown value '{}' for {}", v, name);
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a comma-separated list from the environment
pub fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
