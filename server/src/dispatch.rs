//! Recipient selection for packets sent by clients.

use shared::{ClientId, Target};
use std::collections::HashMap;

/// Resolves which registered clients receive a packet from `sender`.
///
/// - `Target::Client(id)` reaches `id` only if it is registered; otherwise
///   nobody, and the sender is not told.
/// - `Target::Broadcast` reaches every registered client except the sender,
///   unless `include_self` is set.
pub fn recipients<T>(
    sender: ClientId,
    target: Target,
    clients: &HashMap<ClientId, T>,
) -> Vec<ClientId> {
    match target {
        Target::Client(client_id) => {
            if clients.contains_key(&client_id) {
                vec![client_id]
            } else {
                Vec::new()
            }
        }
        Target::Broadcast { include_self } => clients
            .keys()
            .copied()
            .filter(|client_id| include_self || *client_id != sender)
            .collect(),
    }
}
