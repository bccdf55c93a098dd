//! Fair distribution of engine threads across participating workers

use crate::config::ThreadAllocation;

/// Threads one worker runs and where they sit in the global numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSlice {
    /// Global index of the first local thread
    pub first_global_index: usize,
    /// Number of local threads
    pub count: usize,
}

/// Threads owned by the worker at `position` among `participants`
///
/// With a total allocation, position `i` of `n` gets
/// `(i+1)*total/n - i*total/n` threads, so counts differ by at most one
/// and add up to `total`.
pub fn thread_slice(allocation: ThreadAllocation, position: usize, participants: usize) -> ThreadSlice {
    let participants = participants.max(1);
    match allocation {
        ThreadAllocation::PerNode(per_node) => ThreadSlice {
            first_global_index: position * per_node,
            count: per_node,
        },
        ThreadAllocation::Total(total) => {
            let lower = share_boundary(position, participants, total);
            let upper = share_boundary(position + 1, participants, total);
            ThreadSlice {
                first_global_index: lower,
                count: upper - lower,
            }
        }
    }
}

fn share_boundary(position: usize, participants: usize, total: usize) -> usize {
    (position as u128 * total as u128 / participants as u128) as usize
}
