//! robots.txt parsing and path matching.

use std::time::Duration;

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    pattern: String,
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
    crawl_delay: Option<Duration>,
}

/// Parsed robots policy for a single host.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    groups: Vec<Group>,
    disallow_all: bool,
}

impl RobotsPolicy {
    /// Policy used when the host answers 401/403 for robots.txt.
    pub fn disallow_all() -> Self {
        Self {
            groups: Vec::new(),
            disallow_all: true,
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut in_rules = false;

        for raw_line in content.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    if in_rules {
                        groups.push(std::mem::take(&mut current));
                        in_rules = false;
                    }
                    current.agents.push(value.to_ascii_lowercase());
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    // An empty Disallow means "allow everything" and carries no rule.
                    if !value.is_empty() {
                        current.rules.push(Rule {
                            allow: directive == "allow",
                            pattern: value.to_string(),
                        });
                    }
                }
                "crawl-delay" => {
                    in_rules = true;
                    // Negative, NaN and out-of-range values are ignored.
                    if let Some(delay) = value
                        .parse::<f64>()
                        .ok()
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    {
                        current.crawl_delay = Some(delay);
                    }
                }
                _ => {}
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }

        Self {
            groups,
            disallow_all: false,
        }
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let product = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .trim()
            .to_ascii_lowercase();

        self.groups
            .iter()
            .find(|g| {
                g.agents
                    .iter()
                    .any(|a| a != "*" && !a.is_empty() && product.contains(a.as_str()))
            })
            .or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")))
    }

    /// `path` is the URL path plus optional `?query`.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        if self.disallow_all {
            return false;
        }
        if path == "/robots.txt" {
            return true;
        }
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };

        let mut best: Option<(usize, bool)> = None;
        for rule in &group.rules {
            if !rule_matches(&rule.pattern, path) {
                continue;
            }
            let len = rule.pattern.len();
            best = match best {
                Some((best_len, best_allow)) if best_len > len => Some((best_len, best_allow)),
                Some((best_len, best_allow)) if best_len == len => Some((len, best_allow || rule.allow)),
                _ => Some((len, rule.allow)),
            };
        }
        best.map_or(true, |(_, allow)| allow)
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.group_for(user_agent).and_then(|g| g.crawl_delay)
    }
}

/// Prefix match with `*` wildcards and an optional trailing `$` end anchor.
fn rule_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };

    let mut pieces = pattern.split('*');
    let first = pieces.next().unwrap_or("");
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    let rest: Vec<&str> = pieces.collect();

    for (i, piece) in rest.iter().enumerate() {
        let is_last = i + 1 == rest.len();
        if is_last && anchored {
            return match path.len().checked_sub(piece.len()) {
                Some(start) => start >= pos && path.ends_with(piece),
                None => false,
            };
        }
        match path[pos..].find(piece) {
            Some(idx) => pos += idx + piece.len(),
            None => return false,
        }
    }

    !anchored || pos == path.len()
}
