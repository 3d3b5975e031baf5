//! One-shot family discovery at node startup.

use crate::server::{FamilyRegistry, NodeInfo, PeerApi};

/// Probes the well-known ports `[base_port, me.port)` on my host, lowest
/// first, sending a `Join` to each. The first peer that answers has its view
/// merged into the registry and probing stops there. Returns the peer that
/// let me in, or `None` if nobody answered, in which case I am the founding
/// member.
pub async fn join_family(
    registry: &FamilyRegistry,
    peer_api: &dyn PeerApi,
    base_port: u16,
) -> Option<NodeInfo> {
    let me = registry.me();

    for port in base_port..me.port {
        let target = NodeInfo::new(me.host.clone(), port);
        match peer_api.join(&target, me).await {
            Ok(view) => {
                let added = registry.add_all(view);
                pf_info!(me; "joined through {}, learned {} member(s), family size {}",
                             target, added, registry.size());
                return Some(target);
            }
            Err(e) => {
                pf_debug!(me; "no family member at {}: {}", target, e);
            }
        }
    }

    pf_info!(me; "no family found below port {}, starting as founder", me.port);
    None
}
