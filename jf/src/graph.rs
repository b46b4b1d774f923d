//! Dependency graph over a loaded plan
//!
//! Built fresh from a [`Plan`] whenever a scheduling decision is made. The
//! graph borrows the plan and never outlives one load-compute-persist cycle.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use tracing::debug;

use crate::domain::{Job, JobStatus, Plan, dependency_met};
use crate::error::{FlowError, FlowResult};

/// Acyclic dependency relation between the jobs of one plan
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    plan: &'a Plan,
    /// Dependency indices per job, in plan order
    deps: Vec<Vec<usize>>,
    index: HashMap<&'a str, usize>,
}

impl<'a> DependencyGraph<'a> {
    /// Resolve every reference and reject cycles
    pub fn build(plan: &'a Plan) -> FlowResult<Self> {
        debug!(plan = %plan.name, jobs = plan.len(), "DependencyGraph::build: called");
        let jobs = plan.jobs();
        let index: HashMap<&str, usize> = jobs.iter().enumerate().map(|(i, j)| (j.id.as_str(), i)).collect();

        let mut deps = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut edges = Vec::with_capacity(job.depends_on.len());
            for reference in &job.depends_on {
                let dep = plan.find(reference).ok_or_else(|| FlowError::UnresolvedDependency {
                    job: job.id.clone(),
                    reference: reference.clone(),
                })?;
                let idx = index[dep.id.as_str()];
                if !edges.contains(&idx) {
                    edges.push(idx);
                }
            }
            deps.push(edges);
        }

        let graph = Self { plan, deps, index };
        if let Some(cycle) = graph.find_cycle() {
            debug!(?cycle, "DependencyGraph::build: cycle detected");
            return Err(FlowError::CyclicDependency(cycle));
        }
        debug!("DependencyGraph::build: no cycles found");
        Ok(graph)
    }

    pub fn plan(&self) -> &'a Plan {
        self.plan
    }

    /// Jobs that may start now, in plan order
    pub fn runnable_jobs(&self) -> Vec<&'a Job> {
        let runnable: Vec<&Job> = (0..self.deps.len())
            .filter(|&i| self.is_runnable_idx(i))
            .map(|i| &self.plan.jobs()[i])
            .collect();
        debug!(count = runnable.len(), "DependencyGraph::runnable_jobs: computed");
        runnable
    }

    pub fn is_runnable(&self, job_id: &str) -> bool {
        self.index.get(job_id).is_some_and(|&i| self.is_runnable_idx(i))
    }

    fn is_runnable_idx(&self, idx: usize) -> bool {
        let job = &self.plan.jobs()[idx];
        job.status == JobStatus::Pending && self.deps[idx].iter().all(|&d| dependency_met(job, &self.plan.jobs()[d]))
    }

    /// Direct dependencies of a job
    pub fn dependencies(&self, job_id: &str) -> Vec<&'a Job> {
        self.index
            .get(job_id)
            .map(|&i| self.deps[i].iter().map(|&d| &self.plan.jobs()[d]).collect())
            .unwrap_or_default()
    }

    /// Jobs that depend directly on `job_id`, in plan order
    pub fn dependents(&self, job_id: &str) -> Vec<&'a Job> {
        let Some(&target) = self.index.get(job_id) else {
            return Vec::new();
        };
        self.deps
            .iter()
            .enumerate()
            .filter(|(_, edges)| edges.contains(&target))
            .map(|(i, _)| &self.plan.jobs()[i])
            .collect()
    }

    /// Dependencies of `job_id` that are not yet met, as `id (status)`
    pub fn unmet_dependencies(&self, job_id: &str) -> FlowResult<Vec<String>> {
        let &idx = self
            .index
            .get(job_id)
            .ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))?;
        let job = &self.plan.jobs()[idx];
        Ok(self.deps[idx]
            .iter()
            .map(|&d| &self.plan.jobs()[d])
            .filter(|dep| !dependency_met(job, dep))
            .map(|dep| format!("{} ({})", dep.id, dep.status))
            .collect())
    }

    /// Jobs with dependencies ahead of dependents; ties keep plan order
    pub fn topological_order(&self) -> Vec<&'a Job> {
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.deps.len());
        for idx in 0..self.deps.len() {
            self.topo_visit(idx, &mut visited, &mut order);
        }
        order.into_iter().map(|i| &self.plan.jobs()[i]).collect()
    }

    fn topo_visit(&self, idx: usize, visited: &mut HashSet<usize>, order: &mut Vec<usize>) {
        if !visited.insert(idx) {
            return;
        }
        for &dep in &self.deps[idx] {
            self.topo_visit(dep, visited, order);
        }
        order.push(idx);
    }

    /// Group jobs into levels; every job's dependencies sit in earlier levels
    pub fn execution_stages(&self) -> Vec<Vec<&'a Job>> {
        let mut level = vec![0usize; self.deps.len()];
        for job in self.topological_order() {
            let idx = self.index[job.id.as_str()];
            level[idx] = self.deps[idx].iter().map(|&d| level[d] + 1).max().unwrap_or(0);
        }

        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut stages: Vec<Vec<&Job>> = vec![Vec::new(); depth];
        for (idx, job) in self.plan.jobs().iter().enumerate() {
            stages[level[idx]].push(job);
        }
        stages
    }

    /// Render as a mermaid flowchart
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for job in self.plan.jobs() {
            let label = format!("{} ({})", job.title, job.status).replace('"', "#quot;");
            let _ = writeln!(out, "    {}[\"{}\"]", mermaid_id(&job.id), label);
        }
        for (idx, edges) in self.deps.iter().enumerate() {
            let to = &self.plan.jobs()[idx].id;
            for &dep in edges {
                let _ = writeln!(out, "    {} --> {}", mermaid_id(&self.plan.jobs()[dep].id), mermaid_id(to));
            }
        }
        out
    }

    /// First cycle reachable in plan order, from the repeated job back to itself
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for idx in 0..self.deps.len() {
            if !visited.contains(&idx) && self.has_cycle_dfs(idx, &mut visited, &mut rec_stack, &mut path) {
                let repeated = path.last().copied()?;
                let start = path.iter().position(|&i| i == repeated)?;
                return Some(path[start..].iter().map(|&i| self.plan.jobs()[i].id.clone()).collect());
            }
        }
        None
    }

    fn has_cycle_dfs(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        for &dep in &self.deps[node] {
            if rec_stack.contains(&dep) {
                debug!(node, dep, "has_cycle_dfs: back edge found");
                path.push(dep);
                return true;
            }
            if !visited.contains(&dep) && self.has_cycle_dfs(dep, visited, rec_stack, path) {
                return true;
            }
        }

        rec_stack.remove(&node);
        path.pop();
        false
    }
}

fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
