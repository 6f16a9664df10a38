//! Server-side scripts for atomic state transitions.
//!
//! Every multi-step transition is a single Lua script so concurrent workers
//! never observe a split state. Scripts are loaded once per connection and
//! invoked by hash (`EVALSHA` with automatic `EVAL` fallback).
//!
//! The sources live in `lua/`; keys are derived inside the scripts from a
//! base-prefix argument, which assumes a single (non-cluster) Redis, the
//! same deployment shape the rest of the platform targets.

use redis::Script;

pub(crate) struct ScriptSet {
    pub add_job: Script,
    pub promote_delayed: Script,
    pub fetch_next: Script,
    pub complete_job: Script,
    pub fail_job: Script,
    pub extend_lock: Script,
    pub stall_check: Script,
    pub release_locks: Script,
    pub remove_job: Script,
    pub drain: Script,
    pub clean_jobs: Script,
    pub obliterate: Script,
    pub add_flow: Script,
    pub refresh_leader: Script,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self {
            add_job: Script::new(include_str!("../lua/add_job.lua")),
            promote_delayed: Script::new(include_str!("../lua/promote_delayed.lua")),
            fetch_next: Script::new(include_str!("../lua/fetch_next.lua")),
            complete_job: Script::new(include_str!("../lua/complete_job.lua")),
            fail_job: Script::new(include_str!("../lua/fail_job.lua")),
            extend_lock: Script::new(include_str!("../lua/extend_lock.lua")),
            stall_check: Script::new(include_str!("../lua/stall_check.lua")),
            release_locks: Script::new(include_str!("../lua/release_locks.lua")),
            remove_job: Script::new(include_str!("../lua/remove_job.lua")),
            drain: Script::new(include_str!("../lua/drain.lua")),
            clean_jobs: Script::new(include_str!("../lua/clean_jobs.lua")),
            obliterate: Script::new(include_str!("../lua/obliterate.lua")),
            add_flow: Script::new(include_str!("../lua/add_flow.lua")),
            refresh_leader: Script::new(include_str!("../lua/refresh_leader.lua")),
        }
    }
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_scripts_are_distinct() {
        let scripts = ScriptSet::new();
        let hashes: HashSet<&str> = [
            scripts.add_job.get_hash(),
            scripts.promote_delayed.get_hash(),
            scripts.fetch_next.get_hash(),
            scripts.complete_job.get_hash(),
            scripts.fail_job.get_hash(),
            scripts.extend_lock.get_hash(),
            scripts.stall_check.get_hash(),
            scripts.release_locks.get_hash(),
            scripts.remove_job.get_hash(),
            scripts.drain.get_hash(),
            scripts.clean_jobs.get_hash(),
            scripts.obliterate.get_hash(),
            scripts.add_flow.get_hash(),
            scripts.refresh_leader.get_hash(),
        ]
        .into_iter()
        .collect();

        assert_eq!(hashes.len(), 14);
    }
}
