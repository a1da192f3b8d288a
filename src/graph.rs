//! Task graph and scheduler.
//!
//! Kernels are appended to a [`JobGraph`]; each append infers its dependencies from
//! the kernel's declared read and write sets against the jobs already in the graph:
//!
//! - read-after-write: a reader waits for the last writer of the buffer;
//! - write-after-read: a writer waits for every reader since the last write;
//! - write-after-write: a writer waits for the previous writer.
//!
//! Nothing runs until a [`Scheduler`] is asked to wait on a handle. It then runs the
//! pending ancestors of that handle on its worker pool in dataflow order: a job is
//! spawned as soon as its last dependency finishes, so jobs with disjoint buffers
//! overlap freely. Waiting blocks until all of them are done. There is no
//! cancellation; a submitted step always runs to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::arena::{Arena, BufferId};
use crate::error::Result;
use crate::kernel::Kernel;

/// Completion handle for a scheduled job.
///
/// Waiting on a handle also waits on everything it depends on. Handles from before
/// the last [`Scheduler::complete`] refer to work that has already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Job {
    /// `None` marks a fence created by [`JobGraph::combine`].
    kernel: Option<Kernel>,
    deps: Vec<usize>,
    done: bool,
}

#[derive(Debug, Default)]
pub struct JobGraph {
    jobs: Vec<Job>,
    last_writer: HashMap<BufferId, usize>,
    readers: HashMap<BufferId, Vec<usize>>,
    generation: u64,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `kernel` against `arena` and appends it.
    pub fn schedule(&mut self, arena: &Arena, kernel: Kernel) -> Result<JobHandle> {
        kernel.validate(arena)?;

        let index = self.jobs.len();
        let write = kernel.write();
        let mut deps = Vec::new();

        for read in kernel.reads() {
            if let Some(&writer) = self.last_writer.get(&read) {
                deps.push(writer);
            }
        }
        if let Some(&writer) = self.last_writer.get(&write) {
            deps.push(writer);
        }
        if let Some(readers) = self.readers.get_mut(&write) {
            deps.append(readers);
        }
        deps.sort_unstable();
        deps.dedup();

        for read in kernel.reads() {
            self.readers.entry(read).or_default().push(index);
        }
        self.last_writer.insert(write, index);

        trace!(job = index, kernel = kernel.name(), deps = deps.len(), "scheduled");
        self.jobs.push(Job {
            kernel: Some(kernel),
            deps,
            done: false,
        });
        Ok(self.handle(index))
    }

    /// A handle that completes once every handle in `handles` has completed.
    pub fn combine(&mut self, handles: &[JobHandle]) -> JobHandle {
        let index = self.jobs.len();
        let mut deps: Vec<usize> = handles
            .iter()
            .filter(|h| h.generation == self.generation)
            .map(|h| h.index)
            .collect();
        deps.sort_unstable();
        deps.dedup();
        self.jobs.push(Job {
            kernel: None,
            deps,
            done: false,
        });
        self.handle(index)
    }

    /// Number of jobs appended since the last reset, including finished ones.
    #[inline]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs that have not run yet.
    pub fn pending(&self) -> usize {
        self.jobs.iter().filter(|j| !j.done).count()
    }

    pub fn is_complete(&self, handle: JobHandle) -> bool {
        handle.generation != self.generation || self.jobs[handle.index].done
    }

    /// Drops every job, run or not. Outstanding handles count as complete afterwards.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.last_writer.clear();
        self.readers.clear();
        self.generation += 1;
    }

    #[inline]
    fn handle(&self, index: usize) -> JobHandle {
        JobHandle {
            index,
            generation: self.generation,
        }
    }

    /// Pending ancestors of `index` (inclusive), in ascending order.
    fn pending_closure(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.jobs.len()];
        let mut stack = vec![index];
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen[i] || self.jobs[i].done {
                continue;
            }
            seen[i] = true;
            out.push(i);
            stack.extend(self.jobs[i].deps.iter().copied());
        }
        out.sort_unstable();
        out
    }
}

/// Worker pool that executes [`JobGraph`]s.
pub struct Scheduler {
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.threads())
            .finish()
    }
}

impl Scheduler {
    /// `threads: None` uses rayon's default (one worker per logical CPU).
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("jobnet-worker-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        Ok(Self {
            pool: builder.build()?,
        })
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `handle` and its pending ancestors, blocking until they finish.
    pub fn wait(&self, graph: &mut JobGraph, arena: &Arena, handle: JobHandle) {
        if graph.is_complete(handle) {
            return;
        }
        let needed = graph.pending_closure(handle.index);
        self.execute(graph, arena, &needed);
    }

    /// Runs every pending job, then resets the graph for reuse.
    pub fn complete(&self, graph: &mut JobGraph, arena: &Arena) {
        let needed: Vec<usize> = (0..graph.jobs.len())
            .filter(|&i| !graph.jobs[i].done)
            .collect();
        self.execute(graph, arena, &needed);
        graph.clear();
    }

    fn execute(&self, graph: &mut JobGraph, arena: &Arena, needed: &[usize]) {
        if needed.is_empty() {
            return;
        }

        let mut position = vec![usize::MAX; graph.jobs.len()];
        for (p, &j) in needed.iter().enumerate() {
            position[j] = p;
        }

        // Every pending dependency of a needed job is itself needed.
        let mut dependents = vec![Vec::new(); needed.len()];
        let mut remaining = Vec::with_capacity(needed.len());
        for (p, &j) in needed.iter().enumerate() {
            let mut count = 0;
            for &d in &graph.jobs[j].deps {
                if !graph.jobs[d].done {
                    dependents[position[d]].push(p);
                    count += 1;
                }
            }
            remaining.push(AtomicUsize::new(count));
        }

        debug!(
            jobs = needed.len(),
            workers = self.threads(),
            "running task graph"
        );

        let run = Dataflow {
            jobs: &graph.jobs,
            needed,
            dependents: &dependents,
            remaining: &remaining,
            arena,
        };
        self.pool.scope(|scope| {
            for p in 0..needed.len() {
                if run.remaining[p].load(Ordering::Acquire) == 0 {
                    run.spawn(scope, p);
                }
            }
        });

        for &j in needed {
            graph.jobs[j].done = true;
        }
    }
}

struct Dataflow<'a> {
    jobs: &'a [Job],
    needed: &'a [usize],
    dependents: &'a [Vec<usize>],
    remaining: &'a [AtomicUsize],
    arena: &'a Arena,
}

impl Dataflow<'_> {
    fn spawn<'s>(&'s self, scope: &rayon::Scope<'s>, p: usize) {
        scope.spawn(move |scope| {
            if let Some(kernel) = &self.jobs[self.needed[p]].kernel {
                kernel.run(self.arena);
            }
            for &next in &self.dependents[p] {
                if self.remaining[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.spawn(scope, next);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::activation::Activation;

    #[test]
    fn infers_raw_war_and_waw_dependencies() {
        let mut arena = Arena::new();
        let a = arena.alloc(2);
        let b = arena.alloc(2);
        let c = arena.alloc(2);
        let mut graph = JobGraph::new();

        let w_a = graph.schedule(&arena, Kernel::Zero { buffer: a }).unwrap();
        let a_to_b = graph
            .schedule(&arena, Kernel::Copy { src: a, dst: b })
            .unwrap();
        let a_to_c = graph
            .schedule(&arena, Kernel::Copy { src: a, dst: c })
            .unwrap();
        let w_a_again = graph
            .schedule(
                &arena,
                Kernel::Activate {
                    buffer: a,
                    activation: Activation::Sigmoid,
                },
            )
            .unwrap();

        assert_eq!(graph.jobs[a_to_b.index].deps, vec![w_a.index]);
        assert_eq!(graph.jobs[a_to_c.index].deps, vec![w_a.index]);
        assert_eq!(
            graph.jobs[w_a_again.index].deps,
            vec![w_a.index, a_to_b.index, a_to_c.index]
        );
    }

    #[test]
    fn wait_runs_only_ancestors() {
        let mut arena = Arena::new();
        let a = arena.alloc_from(vec![1.0, 2.0]);
        let b = arena.alloc(2);
        let c = arena.alloc_from(vec![5.0, 5.0]);
        let scheduler = Scheduler::new(Some(2)).unwrap();
        let mut graph = JobGraph::new();

        let copy = graph
            .schedule(&arena, Kernel::Copy { src: a, dst: b })
            .unwrap();
        let unrelated = graph.schedule(&arena, Kernel::Zero { buffer: c }).unwrap();

        scheduler.wait(&mut graph, &arena, copy);
        assert!(graph.is_complete(copy));
        assert!(!graph.is_complete(unrelated));
        assert_eq!(&*arena.read(b), &[1.0, 2.0]);
        assert_eq!(&*arena.read(c), &[5.0, 5.0]);

        scheduler.complete(&mut graph, &arena);
        assert!(graph.is_empty());
        assert!(graph.is_complete(unrelated));
        assert_eq!(&*arena.read(c), &[0.0, 0.0]);
    }

    #[test]
    fn chained_accumulates_serialize() {
        let mut arena = Arena::new();
        let acc = arena.alloc(64);
        let ones = arena.alloc_from(vec![1.0; 64]);
        let scheduler = Scheduler::new(Some(4)).unwrap();
        let mut graph = JobGraph::new();

        let mut handles = Vec::new();
        for _ in 0..32 {
            handles.push(
                graph
                    .schedule(&arena, Kernel::Accumulate { src: ones, dst: acc })
                    .unwrap(),
            );
        }
        let all = graph.combine(&handles);
        scheduler.wait(&mut graph, &arena, all);

        assert!(arena.read(acc).iter().all(|&v| v == 32.0));
        assert_eq!(graph.pending(), 0);
    }

    #[test]
    fn rejected_kernel_is_not_added() {
        let mut arena = Arena::new();
        let a = arena.alloc(2);
        let b = arena.alloc(3);
        let mut graph = JobGraph::new();
        assert!(
            graph
                .schedule(&arena, Kernel::Copy { src: a, dst: b })
                .is_err()
        );
        assert!(graph.is_empty());
    }
}
