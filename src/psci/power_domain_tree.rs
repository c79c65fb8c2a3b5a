// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The static power-domain tree and its locking discipline.
//!
//! Leaves are CPU power domains, interior nodes are clusters and the system
//! root. The tree is built once at cold boot from the platform's breadth-first
//! topology descriptor and never resized. Each non-CPU node carries its own
//! spinlock; state coordination locks the ancestor chain of a CPU strictly
//! bottom-up and releases it top-down, and is only reachable through the
//! [`PowerDomainTree::with_ancestors_locked`] helpers so that no call site can
//! acquire the chain in any other order.

use super::{EntryPoint, LocalState};
use crate::platform::{Platform, PlatformImpl};
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    slice::{Iter, IterMut},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// Panic message for a topology descriptor that exceeds the compile-time
/// bounds.
const TOPOLOGY_OVERFLOW: &str = "power domain topology exceeds compile-time bounds";

/// A non-CPU power domain node: a cluster or the system root.
///
/// The node is cache-line aligned because its local state is read by harts
/// whose data cache is disabled; writers flush it after every mutation so that
/// no other node's data shares the lines.
#[derive(Debug)]
#[repr(align(64))]
pub struct NonCpuPowerNode {
    /// Parent node index, or `None` for the system root.
    parent: Option<usize>,
    /// Power level of this node: 1 for clusters, 2 for the system root.
    level: usize,
    /// Local power state of the domain.
    local_state: LocalState,
    /// The contiguous range of CPU indices under this node.
    cpu_range: Range<usize>,
    /// The state each descendant CPU most recently requested for this node.
    requested_states: ArrayVec<LocalState, { PowerDomainTree::CPU_DOMAIN_COUNT }>,
}

impl NonCpuPowerNode {
    fn new(parent: Option<usize>, level: usize) -> Self {
        Self {
            parent,
            level,
            local_state: LocalState::Off,
            cpu_range: 0..0,
            requested_states: ArrayVec::new(),
        }
    }

    /// Records one more descendant CPU. CPUs under a node have adjacent
    /// indices, assigned in ascending order during construction.
    fn assign_cpu(&mut self, cpu_index: usize) {
        if self.cpu_range.is_empty() {
            self.cpu_range = cpu_index..cpu_index + 1;
        } else {
            debug_assert_eq!(self.cpu_range.end, cpu_index);
            self.cpu_range.end += 1;
        }

        self.requested_states.push(LocalState::Off);
    }

    /// Power level of this node.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Stores the power state a descendant CPU requests for this node.
    pub fn set_requested_power_state(&mut self, cpu_index: usize, state: LocalState) {
        assert!(self.cpu_range.contains(&cpu_index));
        self.requested_states[cpu_index - self.cpu_range.start] = state;
    }

    /// Applies the coordination rule: the domain enters the shallowest state
    /// any descendant CPU requested. A single CPU requesting RUN keeps the
    /// whole domain running.
    pub fn set_coordinated_state(&mut self) {
        self.local_state = *self.requested_states.iter().min().unwrap();
    }

    /// Local power state of the domain.
    pub fn local_state(&self) -> LocalState {
        self.local_state
    }

    /// Sets the local power state of the domain.
    pub fn set_local_state(&mut self, local_state: LocalState) {
        self.local_state = local_state;
    }
}

/// A CPU power domain node.
///
/// Affinity and local power state of a CPU live in its per-CPU record so that
/// they stay reachable with the data cache disabled; the tree node only keeps
/// the wakeup entry point, protected by the per-CPU lock that also serialises
/// concurrent `cpu_on` calls against this CPU.
#[derive(Debug)]
pub struct CpuPowerNode {
    /// Non-secure entry point to hand back when the CPU next warm boots.
    entry_point: Option<EntryPoint>,
}

impl CpuPowerNode {
    const fn new() -> Self {
        Self { entry_point: None }
    }

    /// Stores the wakeup entry point of the CPU.
    pub fn set_entry_point(&mut self, entry_point: EntryPoint) {
        assert_eq!(self.entry_point, None);
        self.entry_point = Some(entry_point);
    }

    /// Takes the stored wakeup entry point of the CPU.
    pub fn pop_entry_point(&mut self) -> Option<EntryPoint> {
        self.entry_point.take()
    }
}

/// The locked ancestor chain of a CPU, from its cluster up to some end level.
///
/// Locks are taken bottom-up in [`Self::new_with_max_level`] and released
/// top-down on drop, which is the only ordering that cannot deadlock against
/// another hart coordinating in an overlapping subtree.
pub struct AncestorPowerDomains<'a> {
    list: ArrayVec<SpinMutexGuard<'a, NonCpuPowerNode>, { PlatformImpl::MAX_POWER_LEVEL }>,
}

impl<'a> AncestorPowerDomains<'a> {
    fn new_with_max_level(
        parent_index: usize,
        max_level: usize,
        mutexes: &'a [SpinMutex<NonCpuPowerNode>],
    ) -> Self {
        let mut list = ArrayVec::new();
        let mut parent = Some(parent_index);
        let mut level = 1;

        while let Some(index) = parent {
            assert!(level <= PlatformImpl::MAX_POWER_LEVEL);
            if level > max_level {
                break;
            }

            let locked = mutexes[index].lock();
            parent = locked.parent;
            list.push(locked);
            level += 1;
        }

        Self { list }
    }

    /// Iterates over the locked ancestors from the lowest level upwards.
    pub fn iter(&self) -> Iter<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter()
    }

    /// Mutably iterates over the locked ancestors from the lowest level
    /// upwards.
    pub fn iter_mut(&mut self) -> IterMut<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter_mut()
    }

    /// The number of locked levels.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether no ancestor is locked.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl Drop for AncestorPowerDomains<'_> {
    fn drop(&mut self) {
        // Release top-down.
        while let Some(guard) = self.list.pop() {
            drop(guard);
        }
    }
}

/// The power-domain tree: non-CPU nodes, CPU nodes and their locks.
pub struct PowerDomainTree {
    non_cpu_nodes: ArrayVec<SpinMutex<NonCpuPowerNode>, { Self::NON_CPU_DOMAIN_COUNT }>,
    /// Parent node index of each CPU, immutable after construction.
    cpu_parents: ArrayVec<usize, { Self::CPU_DOMAIN_COUNT }>,
    cpu_nodes: ArrayVec<SpinMutex<CpuPowerNode>, { Self::CPU_DOMAIN_COUNT }>,
}

impl PowerDomainTree {
    const CPU_DOMAIN_COUNT: usize = PlatformImpl::CORE_COUNT;
    const NON_CPU_DOMAIN_COUNT: usize = PlatformImpl::NON_CPU_DOMAIN_COUNT;

    /// Builds the tree from the breadth-first topology descriptor: the first
    /// entry is the number of roots, each following entry the child count of
    /// a previously described node, leaves being CPUs.
    pub fn new(topology: &[usize]) -> Self {
        let mut non_cpu_nodes: ArrayVec<SpinMutex<NonCpuPowerNode>, { Self::NON_CPU_DOMAIN_COUNT }> =
            ArrayVec::new();
        let mut node_index = 0..Self::NON_CPU_DOMAIN_COUNT;
        let mut node_count: usize = 1;
        let mut parent_node_index: usize = 0;
        let mut parent_node = None;

        for level in (1..=PlatformImpl::MAX_POWER_LEVEL).rev() {
            let mut next_level_node_count = 0;

            for _ in 0..node_count {
                let child_count = topology[parent_node_index];

                for _ in (&mut node_index).take(child_count) {
                    non_cpu_nodes
                        .try_push(SpinMutex::new(NonCpuPowerNode::new(parent_node, level)))
                        .expect(TOPOLOGY_OVERFLOW);
                }

                parent_node = Some(parent_node_index);
                next_level_node_count += child_count;
                parent_node_index += 1;
            }

            node_count = next_level_node_count;
        }

        // Every non-CPU slot must have been described by the topology.
        debug_assert!(node_index.is_empty());

        let mut cpu_parents = ArrayVec::new();
        let mut cpu_nodes = ArrayVec::new();
        let mut node_index = 0..Self::CPU_DOMAIN_COUNT;
        for child_count in &topology[parent_node_index..] {
            for cpu_index in (&mut node_index).take(*child_count) {
                cpu_parents
                    .try_push(parent_node_index - 1)
                    .expect(TOPOLOGY_OVERFLOW);
                cpu_nodes
                    .try_push(SpinMutex::new(CpuPowerNode::new()))
                    .expect(TOPOLOGY_OVERFLOW);
                Self::assign_cpu(&non_cpu_nodes, parent_node_index - 1, cpu_index);
            }

            parent_node_index += 1;
        }

        debug_assert!(node_index.is_empty());

        PowerDomainTree {
            non_cpu_nodes,
            cpu_parents,
            cpu_nodes,
        }
    }

    /// Records a CPU in the descendant range of every ancestor, walking up to
    /// the root.
    fn assign_cpu(
        non_cpu_nodes: &[SpinMutex<NonCpuPowerNode>],
        parent_index: usize,
        cpu_index: usize,
    ) {
        let mut node = non_cpu_nodes[parent_index].lock();
        node.assign_cpu(cpu_index);
        if let Some(parent_index) = node.parent {
            Self::assign_cpu(non_cpu_nodes, parent_index, cpu_index);
        }
    }

    /// Returns the lock-guarded CPU node of `cpu_index`.
    ///
    /// The guard is the CPU's `cpu_lock`: holding it serialises concurrent
    /// `cpu_on` requests against this CPU and hands out the entry-point slot.
    pub fn locked_cpu_node(&self, cpu_index: usize) -> SpinMutexGuard<'_, CpuPowerNode> {
        self.cpu_nodes[cpu_index].lock()
    }

    /// Locks the full ancestor chain of a CPU, runs `f` and unlocks again.
    pub fn with_ancestors_locked<F, T>(&self, cpu_index: usize, f: F) -> T
    where
        F: FnOnce(AncestorPowerDomains<'_>) -> T,
    {
        self.with_ancestors_locked_to_max_level(cpu_index, PlatformImpl::MAX_POWER_LEVEL, f)
    }

    /// Locks the ancestor chain of a CPU up to `max_level`, runs `f` and
    /// unlocks again.
    pub fn with_ancestors_locked_to_max_level<F, T>(
        &self,
        cpu_index: usize,
        max_level: usize,
        f: F,
    ) -> T
    where
        F: FnOnce(AncestorPowerDomains<'_>) -> T,
    {
        let lock_list = AncestorPowerDomains::new_with_max_level(
            self.cpu_parents[cpu_index],
            max_level,
            &self.non_cpu_nodes,
        );
        f(lock_list)
    }
}

impl Debug for PowerDomainTree {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, node) in self.non_cpu_nodes.iter().enumerate() {
            if let Some(locked) = node.try_lock() {
                writeln!(f, "NC{index} [label=\"{locked:#?}\"]")?;
                if let Some(parent) = locked.parent {
                    writeln!(f, "NC{parent} -> NC{index}")?;
                }
            } else {
                writeln!(f, "NC{index} [label=\"NonCpuPowerNode is locked\"]")?;
            }
        }

        for (index, node) in self.cpu_nodes.iter().enumerate() {
            if let Some(locked) = node.try_lock() {
                writeln!(f, "C{index} [label=\"{locked:#?}\"]")?;
            } else {
                writeln!(f, "C{index} [label=\"CpuPowerNode is locked\"]")?;
            }
            writeln!(f, "NC{} -> C{}", self.cpu_parents[index], index)?;
        }

        writeln!(f, "}}")?;

        Ok(())
    }
}
