use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::pool::Role;

#[derive(Debug, Clone, Copy, Default)]
struct VerbStats {
    total: u64,
    fallbacks: u64,
}

/// Process-wide counters shared by all sessions. This is the narrow
/// reporting surface the router and pool emit events through; rendering and
/// shipping the numbers elsewhere is the caller's business.
#[derive(Debug, Default)]
pub struct Stats {
    // Keyed by (role actually routed to, upper-cased verb).
    by_role_verb: DashMap<(Role, String), VerbStats>,
    unknown_verbs: DashMap<String, u64>,
    failovers: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, role: Role, verb: &str) {
        let mut entry = self
            .by_role_verb
            .entry((role, verb.to_string()))
            .or_default();
        entry.total = entry.total.saturating_add(1);
    }

    /// A read that had to be re-served by master after its replica failed.
    pub fn record_read_fallback(&self, verb: &str) {
        let mut entry = self
            .by_role_verb
            .entry((Role::Replica, verb.to_string()))
            .or_default();
        entry.fallbacks = entry.fallbacks.saturating_add(1);
    }

    /// A verb that hit the conservative classification fallback.
    pub fn record_unknown_verb(&self, verb: &str) {
        let mut entry = self.unknown_verbs.entry(verb.to_string()).or_default();
        *entry = entry.saturating_add(1);
    }

    /// A backend slot transitioned to Down.
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    /// Render a per-verb routing summary, replica traffic first:
    ///
    /// ```text
    /// REPLICA GET              8056 times (fallback 2 times)
    /// MASTER  SET              1200 times
    /// ```
    pub fn render_summary_lines(&self) -> Vec<String> {
        let mut rows: Vec<(Role, String, VerbStats)> = self
            .by_role_verb
            .iter()
            .map(|e| {
                let ((role, verb), stats) = (e.key(), *e.value());
                (*role, verb.clone(), stats)
            })
            .collect();

        rows.sort_by(|a, b| {
            role_rank(a.0)
                .cmp(&role_rank(b.0))
                .then_with(|| b.2.total.cmp(&a.2.total))
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut out = Vec::with_capacity(rows.len() + 2);
        for (role, verb, stats) in rows {
            let role_s = match role {
                Role::Replica => "REPLICA",
                Role::Master => "MASTER",
            };
            let mut line = format!("{role_s:<7} {verb:<16} {} times", stats.total);
            if stats.fallbacks > 0 {
                line.push_str(&format!(" (fallback {} times)", stats.fallbacks));
            }
            out.push(line);
        }

        let failovers = self.failovers();
        if failovers > 0 {
            out.push(format!("backend failovers: {failovers}"));
        }
        for entry in self.unknown_verbs.iter() {
            out.push(format!(
                "unknown verb {} seen {} times (routed as write)",
                entry.key(),
                entry.value()
            ));
        }

        out
    }
}

fn role_rank(r: Role) -> u8 {
    match r {
        Role::Replica => 0,
        Role::Master => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_orders_replica_first() {
        let stats = Stats::new();
        stats.record(Role::Master, "SET");
        stats.record(Role::Replica, "GET");
        stats.record(Role::Replica, "GET");
        stats.record_read_fallback("GET");

        let lines = stats.render_summary_lines();
        assert!(lines[0].starts_with("REPLICA GET"));
        assert!(lines[0].contains("fallback 1 times"));
        assert!(lines[1].starts_with("MASTER  SET"));
    }

    #[test]
    fn unknown_verbs_are_reported() {
        let stats = Stats::new();
        stats.record_unknown_verb("FROBNICATE");
        let lines = stats.render_summary_lines();
        assert!(lines.iter().any(|l| l.contains("FROBNICATE")));
    }
}
