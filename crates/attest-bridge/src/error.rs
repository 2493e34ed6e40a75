use attest_node::NodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A directive call to the node failed.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// The bridge dropped the waiter before completing it.
    #[error("bridge closed before the awaited event arrived")]
    Closed,
}
