//! Process tree tracking
//!
//! Walks from a process up to the root parent. The reaper uses the chain to
//! make sure it never signals the engine that is running it.

use crate::platform::{is_root_process, ProcessTable};

const MAX_TREE_DEPTH: usize = 50;

/// Process chain: `[pid, parent_pid, grandparent_pid, ..., root_pid]`
pub fn ancestor_chain(table: &dyn ProcessTable, pid: u32) -> Vec<u32> {
    let mut chain = vec![pid];
    let mut current_pid = pid;

    for _ in 0..MAX_TREE_DEPTH {
        let Some(parent_pid) = table.lookup(current_pid).and_then(|p| p.parent) else {
            break;
        };
        if parent_pid == current_pid || parent_pid == 0 || chain.contains(&parent_pid) {
            // root reached or a loop in a racing snapshot
            break;
        }
        chain.push(parent_pid);
        current_pid = parent_pid;
        if is_root_process(parent_pid) {
            break;
        }
    }

    chain
}

/// Pids that must never be treated as leaked: this process and its ancestry.
pub fn protected_pids(table: &dyn ProcessTable) -> Vec<u32> {
    ancestor_chain(table, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{LiveProcess, StartTime};
    use crate::platform::{SystemProcessTable, TermSignal};
    use std::collections::HashMap;
    use std::io;

    struct FixedTable(HashMap<u32, Option<u32>>);

    impl ProcessTable for FixedTable {
        fn processes(&self) -> io::Result<Vec<LiveProcess>> {
            Ok(self.0.keys().filter_map(|pid| self.lookup(*pid)).collect())
        }

        fn lookup(&self, pid: u32) -> Option<LiveProcess> {
            self.0.get(&pid).map(|parent| LiveProcess {
                pid,
                start_time: StartTime::from_millis(0),
                parent: *parent,
                command_line: None,
            })
        }

        fn signal(&self, _pid: u32, _signal: TermSignal) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn chain_stops_at_init() {
        let table = FixedTable(HashMap::from([
            (300, Some(200)),
            (200, Some(100)),
            (100, Some(1)),
            (1, Some(0)),
        ]));
        assert_eq!(ancestor_chain(&table, 300), vec![300, 200, 100, 1]);
    }

    #[test]
    fn chain_survives_parent_loops() {
        let table = FixedTable(HashMap::from([(10, Some(11)), (11, Some(10))]));
        assert_eq!(ancestor_chain(&table, 10), vec![10, 11]);
    }

    #[test]
    fn unknown_pid_is_its_own_chain() {
        let table = FixedTable(HashMap::new());
        assert_eq!(ancestor_chain(&table, 77), vec![77]);
    }

    #[test]
    fn current_process_chain_has_a_parent() {
        let chain = protected_pids(&SystemProcessTable::new());
        assert_eq!(chain[0], std::process::id());
        assert!(chain.len() >= 2, "test runner should have a parent: {chain:?}");
    }
}
