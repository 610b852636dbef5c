use std::collections::{HashMap, VecDeque};
use log::{debug, warn};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, RefreshKind, System};

/// Snapshot of the process table only (no CPU, memory or disk data)
fn process_table() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

/// Check whether a process with this PID exists. Zombies count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let sys = process_table();
    match sys.process(Pid::from_u32(pid)) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// All descendants of `pid`, parents before children
pub fn descendants(pid: u32) -> Vec<u32> {
    let sys = process_table();
    collect_descendants(&sys, Pid::from_u32(pid))
        .into_iter()
        .map(|p| p.as_u32())
        .collect()
}

fn collect_descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (child, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            if parent != *child {
                children.entry(parent).or_default().push(*child);
            }
        }
    }

    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                if !order.contains(kid) && *kid != root {
                    order.push(*kid);
                    queue.push_back(*kid);
                }
            }
        }
    }
    order
}

/// Terminate a process and everything it spawned.
///
/// Descendants are killed deepest first so none of them can be re-parented
/// and escape; the root goes last. Returns how many processes were signalled.
pub fn kill_tree(pid: u32) -> usize {
    if pid == 0 {
        return 0;
    }
    let sys = process_table();
    let root = Pid::from_u32(pid);
    let mut victims = collect_descendants(&sys, root);
    victims.reverse();
    victims.push(root);

    let mut killed = 0;
    for victim in victims {
        match sys.process(victim) {
            Some(process) => {
                if process.kill() {
                    killed += 1;
                } else {
                    warn!("Could not kill process {} (tree of {})", victim, pid);
                }
            }
            None => debug!("Process {} already gone (tree of {})", victim, pid),
        }
    }
    debug!("Killed process tree for PID {}: {} process(es)", pid, killed);
    killed
}
