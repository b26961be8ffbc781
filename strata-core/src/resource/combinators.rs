//! Resource Combinators
//!
//! Derive one resource from a fixed list of resources. Every input is read
//! on every evaluation, so the combined node depends on all of them no
//! matter which state decides the result.
//!
//! "First" means first by settlement order: each input's last settling
//! commit carries a domain-wide sequence number, and lower numbers settled
//! earlier. List order only breaks ties.

use super::{Resource, ResourceResult};
use crate::domain::EvalContext;
use crate::error::{GraphError, Result};
use crate::node::{NodeBuilder, NodeValue};

fn combined_key<T: NodeValue>(name: &str, inputs: &[Resource<T>]) -> String {
    let keys: Vec<&str> = inputs.iter().map(|input| input.key().as_str()).collect();
    format!("{}({})", name, keys.join(","))
}

fn read_inputs<T: NodeValue, S: NodeValue>(
    ctx: &EvalContext<S>,
    inputs: &[Resource<T>],
) -> Result<Vec<(ResourceResult<T>, u64)>> {
    inputs
        .iter()
        .map(|input| -> Result<_> {
            Ok((ctx.get(input.node())?, ctx.settled_seq(input.node())?))
        })
        .collect()
}

/// Succeeds with every input's data, in list order, once all inputs have
/// succeeded. Fails as soon as any input fails, with the earliest failure.
pub fn wait_for_all<T: NodeValue>(resources: &[Resource<T>]) -> Resource<Vec<T>> {
    let inputs = resources.to_vec();
    let key = combined_key("wait_for_all", &inputs);

    let node = NodeBuilder::derive(move |ctx: &EvalContext<ResourceResult<Vec<T>>>| {
        let states = read_inputs(ctx, &inputs)?;

        let first_failure = states
            .iter()
            .filter_map(|(state, seq)| state.error().map(|error| (*seq, error)))
            .min_by_key(|(seq, _)| *seq);
        if let Some((_, error)) = first_failure {
            return Ok(ResourceResult::Failure(error.clone()));
        }
        if states.iter().any(|(state, _)| state.is_pending()) {
            return Ok(ResourceResult::Pending);
        }
        Ok(ResourceResult::Success(
            states
                .into_iter()
                .filter_map(|(state, _)| match state {
                    ResourceResult::Success(data) => Some(data),
                    _ => None,
                })
                .collect(),
        ))
    })
    .key(key)
    .build();

    Resource::from_node(node)
}

/// Succeeds with the data of the first input to succeed. Pending while any
/// input is pending and none has succeeded. Fails only once every input has
/// failed, with the most recent failure.
///
/// An empty list fails immediately, since it can never succeed.
pub fn wait_for_any<T: NodeValue>(resources: &[Resource<T>]) -> Resource<T> {
    let inputs = resources.to_vec();
    let key = combined_key("wait_for_any", &inputs);

    let node = NodeBuilder::derive(move |ctx: &EvalContext<ResourceResult<T>>| {
        let states = read_inputs(ctx, &inputs)?;

        let first_success = states
            .iter()
            .filter_map(|(state, seq)| state.data().map(|data| (*seq, data)))
            .min_by_key(|(seq, _)| *seq);
        if let Some((_, data)) = first_success {
            return Ok(ResourceResult::Success(data.clone()));
        }
        if states.iter().any(|(state, _)| state.is_pending()) {
            return Ok(ResourceResult::Pending);
        }
        let last_failure = states
            .iter()
            .filter_map(|(state, seq)| state.error().map(|error| (*seq, error)))
            .max_by_key(|(seq, _)| *seq);
        Ok(match last_failure {
            Some((_, error)) => ResourceResult::Failure(error.clone()),
            None => ResourceResult::Failure(GraphError::NullishValue(ctx.key().clone())),
        })
    })
    .key(key)
    .build();

    Resource::from_node(node)
}
