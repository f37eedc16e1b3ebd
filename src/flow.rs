use crate::context::Context;
use crate::error::Error;
use crate::node::{Node, ProcessState};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata key set on the returned context when a run hits `max_steps`.
pub const STEP_LIMIT_REACHED: &str = "step_limit_reached";
/// Metadata key holding the number of node executions of the run.
pub const STEPS_TAKEN: &str = "steps_taken";

const DEFAULT_MAX_STEPS: usize = 25;

#[derive(Debug, Clone)]
pub struct Transition {
    pub from_node: String,
    pub action: String,
    pub to_node: String,
}

pub struct Flow<S: ProcessState> {
    start_node: String,
    nodes: HashMap<String, Arc<dyn Node<State = S>>>,
    transitions: Vec<Transition>,
    max_steps: usize,
}

impl<S: ProcessState + Default + 'static> Flow<S> {
    pub fn new<N: Node<State = S> + 'static>(start_name: &str, start_node: N) -> Self {
        let mut nodes: HashMap<String, Arc<dyn Node<State = S>>> = HashMap::new();
        nodes.insert(start_name.to_string(), Arc::new(start_node));
        Self {
            start_node: start_name.to_string(),
            nodes,
            transitions: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Caps the number of node executions of a single run.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn add_node<N: Node<State = S> + 'static>(&mut self, name: &str, node: N) {
        self.nodes.insert(name.to_string(), Arc::new(node));
    }

    pub fn add_transition(&mut self, from: &str, state: S, to: &str) {
        self.transitions.push(Transition {
            from_node: from.to_string(),
            action: state.to_condition(),
            to_node: to.to_string(),
        });
    }

    fn get_next_node(&self, current_node: &str, action: &str) -> Option<&str> {
        self.transitions
            .iter()
            .find(|t| t.from_node == current_node && t.action == action)
            .map(|t| t.to_node.as_str())
    }

    /// Runs the flow from its start node and hands back the final context.
    ///
    /// The run ends when the last node's state has no outgoing edge, or when
    /// `max_steps` node executions have happened.
    pub async fn run(&self, mut context: Context) -> Result<Context> {
        info!("Starting flow execution");

        let mut current_node_name = self.start_node.clone();
        let mut steps = 0usize;

        loop {
            if steps >= self.max_steps {
                warn!(
                    "Flow reached its step limit ({}) at node '{}'",
                    self.max_steps, current_node_name
                );
                context.set_metadata(STEP_LIMIT_REACHED, Value::Bool(true));
                break;
            }

            let node = self.nodes.get(&current_node_name).ok_or_else(|| {
                Error::InvalidTransition(format!("node '{}' is not registered", current_node_name))
            })?;
            steps += 1;
            context.set_metadata(STEPS_TAKEN, Value::from(steps));

            node.prepare(&mut context).await?;
            let result = node.execute(&context).await;
            let outcome = node.post_process(&mut context, &result).await?;
            let action = outcome.state.to_condition();

            match self.get_next_node(&current_node_name, &action) {
                Some(next) => {
                    debug!("{} --{}--> {}", current_node_name, action, next);
                    current_node_name = next.to_string();
                }
                None => {
                    debug!("No next node found for action: {}", action);
                    break;
                }
            }
        }

        info!("Flow execution completed after {} steps", steps);
        Ok(context)
    }
}

/// Declares a [`Flow`] from a start node, named nodes and labelled edges.
#[macro_export]
macro_rules! build_flow {
    (
        start: ($start_name:expr, $start_node:expr),
        nodes: [$(($name:expr, $node:expr)),* $(,)?],
        edges: [$(($from:expr, $to:expr, $state:expr)),* $(,)?]
    ) => {{
        let mut flow = $crate::Flow::new($start_name, $start_node);
        $( flow.add_node($name, $node); )*
        $( flow.add_transition($from, $state, $to); )*
        flow
    }};
}
