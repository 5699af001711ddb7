use crate::backup::{
    BackupAction, BackupCoordinator, BackupConfirmDeliveryPayload, BackupEvent,
    BackupQueryPayload, BackupQueryResponsePayload, BackupReplicateAckPayload, ReplicationPayload,
};
use crate::direct_path::{DirectPathEvent, DirectPathManager};
use crate::discovery::{
    DiscoveryEvent, DiscoverySource, EphemeralSubnetManager, HeartbeatTracker, PeerAnnounce,
    SubnetEvent,
};
use crate::envelope::{Envelope, EnvelopeBuilder};
use crate::group::types::EncryptedSenderKey;
use crate::group::{GroupAction, GroupEvent, GroupHub, GroupManager, GroupMessage, GroupPayload};
use crate::relay::{PeerInfo, PeerRole, PeerStatus, RelaySelector, Topology};
use crate::roles::{RoleAction, RoleManager};
use crate::router::{AckType, ReadReceiptPayload, Router, RoutingAction};
use crate::tracker::MessageTracker;
use crate::types::{now_ms, MessageType, NodeId};

use super::effect::RuntimeEffect;
use super::{DeliveredMessage, ProtocolEvent, RuntimeCommand, RuntimeConfig};

// ── Free helpers: GroupPayload <-> wire metadata ─────────────────────────

/// The group this payload concerns, if it names one before creation.
fn group_payload_group_id(payload: &GroupPayload) -> Option<crate::group::GroupId> {
    match payload {
        GroupPayload::Create { .. } => None,
        GroupPayload::Created { group } => Some(group.group_id.clone()),
        GroupPayload::Invite { group_id, .. }
        | GroupPayload::Join { group_id, .. }
        | GroupPayload::Leave { group_id }
        | GroupPayload::MemberJoined { group_id, .. }
        | GroupPayload::MemberLeft { group_id, .. }
        | GroupPayload::DeliveryAck { group_id, .. }
        | GroupPayload::HubMigration { group_id, .. }
        | GroupPayload::HubHeartbeat { group_id, .. }
        | GroupPayload::SenderKeyDistribution { group_id, .. } => Some(group_id.clone()),
        GroupPayload::Sync { group, .. } => Some(group.group_id.clone()),
        GroupPayload::Message(message) => Some(message.group_id.clone()),
    }
}

/// Wire `MessageType` tag for a `GroupPayload` variant.
///
/// `SenderKeyDistribution` reuses `GroupReadReceipt` — that tag otherwise
/// has no `GroupPayload` counterpart (read receipts for groups ride the
/// per-member `DeliveryAck` instead).
fn group_payload_msg_type(payload: &GroupPayload) -> MessageType {
    match payload {
        GroupPayload::Create { .. } => MessageType::GroupCreate,
        GroupPayload::Created { .. } => MessageType::GroupCreated,
        GroupPayload::Invite { .. } => MessageType::GroupInvite,
        GroupPayload::Join { .. } => MessageType::GroupJoin,
        GroupPayload::Sync { .. } => MessageType::GroupSync,
        GroupPayload::Message(_) => MessageType::GroupMessage,
        GroupPayload::Leave { .. } => MessageType::GroupLeave,
        GroupPayload::MemberJoined { .. } => MessageType::GroupMemberJoined,
        GroupPayload::MemberLeft { .. } => MessageType::GroupMemberLeft,
        GroupPayload::DeliveryAck { .. } => MessageType::GroupDeliveryAck,
        GroupPayload::HubMigration { .. } => MessageType::GroupHubMigration,
        GroupPayload::HubHeartbeat { .. } => MessageType::GroupHubHeartbeat,
        GroupPayload::SenderKeyDistribution { .. } => MessageType::GroupReadReceipt,
    }
}

/// Whether a wire `MessageType` belongs to the backup protocol.
///
/// `BackupStore`/`BackupDeliver` are excluded: backup delivery to a
/// reconnected peer rides a plain `Chat` envelope (see
/// `prepare_backup_delivery`), so those two tags have no reader.
fn is_backup_message(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::BackupReplicate
            | MessageType::BackupReplicateAck
            | MessageType::BackupQuery
            | MessageType::BackupQueryResponse
            | MessageType::BackupConfirmDelivery
    )
}

fn is_group_message(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::GroupCreate
            | MessageType::GroupCreated
            | MessageType::GroupInvite
            | MessageType::GroupJoin
            | MessageType::GroupSync
            | MessageType::GroupMessage
            | MessageType::GroupLeave
            | MessageType::GroupMemberJoined
            | MessageType::GroupMemberLeft
            | MessageType::GroupHubMigration
            | MessageType::GroupDeliveryAck
            | MessageType::GroupReadReceipt
            | MessageType::GroupHubHeartbeat
    )
}

/// Etat complet du protocole — logique pure, zero async, zero reseau.
///
/// Chaque methode handle_* / tick_* retourne Vec<RuntimeEffect>.
/// Aucune methode ne touche au reseau ni aux channels.
#[allow(dead_code)] // Fields used by handle_*/tick_* methods (Tasks 6-10)
pub struct RuntimeState {
    pub(crate) local_id: NodeId,
    pub(crate) secret_seed: [u8; 32],
    pub(crate) config: RuntimeConfig,

    // Protocol modules
    pub(crate) router: Router,
    pub(crate) relay_selector: RelaySelector,
    pub(crate) topology: Topology,
    pub(crate) tracker: MessageTracker,
    pub(crate) heartbeat: HeartbeatTracker,

    // Group
    pub(crate) group_manager: GroupManager,
    pub(crate) group_hub: GroupHub,

    // Backup
    pub(crate) backup: BackupCoordinator,

    // Discovery
    pub(crate) subnets: EphemeralSubnetManager,
    pub(crate) role_manager: RoleManager,
    pub(crate) local_roles: Vec<PeerRole>,

    // Direct-path upgrade
    pub(crate) direct_path: DirectPathManager,
}

impl RuntimeState {
    /// Creer un nouvel etat de protocole.
    pub fn new(local_id: NodeId, secret_seed: [u8; 32], config: RuntimeConfig) -> Self {
        Self {
            router: Router::new(local_id),
            relay_selector: RelaySelector::new(local_id),
            topology: Topology::new(),
            tracker: MessageTracker::new(),
            heartbeat: HeartbeatTracker::new(),
            group_manager: GroupManager::new(local_id, config.username.clone()),
            group_hub: GroupHub::new(local_id),
            backup: BackupCoordinator::new(local_id),
            subnets: EphemeralSubnetManager::new(local_id),
            role_manager: RoleManager::new(local_id),
            local_roles: vec![PeerRole::Client],
            direct_path: DirectPathManager::new(),
            local_id,
            secret_seed,
            config,
        }
    }

    // ── Tick: cache cleanup ──────────────────────────────────────────────

    /// Purge expired entries from the router dedup / ACK caches.
    pub fn tick_cache_cleanup(&mut self) -> Vec<RuntimeEffect> {
        self.router.cleanup_caches();
        Vec::new()
    }

    // ── Tick: tracker cleanup ────────────────────────────────────────────

    /// Evict expired message status entries from the tracker.
    pub fn tick_tracker_cleanup(&mut self) -> Vec<RuntimeEffect> {
        self.tracker.evict_expired();
        Vec::new()
    }

    // ── Tick: heartbeat liveness check ───────────────────────────────────

    /// Check all peers for liveness, handle offline/reconnect events.
    ///
    /// - PeerOffline: remove from subnets + role_manager, degrade direct
    ///   path, emit events.
    /// - PeerOnline (reconnect): emit PeerDiscovered, query backup holders
    ///   for anything stored while the peer was away, prepare backup delivery.
    /// - PeerStale: ignored for MVP.
    pub fn tick_heartbeat(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();

        let events = self.heartbeat.check_all(&mut self.topology);
        for disc_event in events {
            match disc_event {
                DiscoveryEvent::PeerOffline { node_id } => {
                    let subnet_events = self.subnets.remove_node(&node_id);
                    for se in &subnet_events {
                        effects.extend(self.surface_subnet_event(se));
                    }
                    self.role_manager.remove_node(&node_id);
                    if let Some(event) = self.direct_path.mark_lost(node_id, now) {
                        effects.extend(self.translate_direct_path_event(event));
                    }
                    effects.push(RuntimeEffect::Emit(ProtocolEvent::PeerOffline {
                        node_id,
                    }));
                }
                DiscoveryEvent::PeerOnline { node_id } => {
                    effects.push(RuntimeEffect::Emit(ProtocolEvent::PeerDiscovered {
                        node_id,
                    }));
                    let query_actions = self.backup.query_pending(node_id, now);
                    effects.extend(self.translate_backup_actions(query_actions));
                    effects.extend(self.prepare_backup_delivery(node_id));
                }
                _ => {} // PeerStale, PeerDiscovered — log or ignore for MVP
            }
        }

        self.heartbeat.cleanup_departed();
        effects
    }

    // ── Tick: presence announce ──────────────────────────────────────────

    /// Broadcast our own `PeerAnnounce` to every peer we currently know
    /// about. Drives discovery at the protocol level — there is no
    /// separate gossip substrate underneath.
    pub fn tick_presence_announce(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let announce = PeerAnnounce::new(self.local_id, self.config.username.clone(), self.local_roles.clone());
        let Ok(bytes) = rmp_serde::to_vec(&announce) else {
            return Vec::new();
        };

        let targets: Vec<NodeId> = self
            .topology
            .peers()
            .filter(|p| p.status != PeerStatus::Offline && p.node_id != self.local_id)
            .map(|p| p.node_id)
            .collect();

        let _ = now;
        targets
            .into_iter()
            .map(|target| {
                let envelope = EnvelopeBuilder::new(
                    self.local_id,
                    target,
                    MessageType::PeerAnnounce,
                    bytes.clone(),
                )
                .sign(&self.secret_seed);
                RuntimeEffect::SendEnvelope(envelope)
            })
            .collect()
    }

    // ── Helper: surface subnet event ─────────────────────────────────────

    /// Convert a SubnetEvent into RuntimeEffects (only Formed/Dissolved surface).
    fn surface_subnet_event(&self, event: &SubnetEvent) -> Vec<RuntimeEffect> {
        let proto_event = match event {
            SubnetEvent::SubnetFormed { subnet } => Some(ProtocolEvent::SubnetFormed {
                subnet_id: subnet.subnet_id.clone(),
                members: subnet.members.iter().copied().collect(),
            }),
            SubnetEvent::SubnetDissolved { subnet_id, reason } => {
                Some(ProtocolEvent::SubnetDissolved {
                    subnet_id: subnet_id.clone(),
                    reason: format!("{reason:?}"),
                })
            }
            // NodeJoined/Left are internal bookkeeping
            _ => None,
        };
        proto_event
            .into_iter()
            .map(RuntimeEffect::Emit)
            .collect()
    }

    // ── Helper: build and sign an outgoing envelope ──────────────────────

    /// Encrypt (if configured) and sign a Chat envelope to `to` via `via`.
    /// Shared by every path that builds an outgoing message envelope so the
    /// encrypt-or-sign branching lives in exactly one place.
    fn build_signed_envelope(
        &self,
        to: NodeId,
        payload: Vec<u8>,
        via: Vec<NodeId>,
    ) -> Result<Envelope, RuntimeEffect> {
        let builder = EnvelopeBuilder::new(self.local_id, to, MessageType::Chat, payload).via(via);

        if self.config.encryption {
            let recipient_pk = to.as_bytes();
            builder
                .encrypt_and_sign(&self.secret_seed, &recipient_pk)
                .map_err(|e| {
                    RuntimeEffect::Emit(ProtocolEvent::Error {
                        description: format!("encryption failed: {e}"),
                    })
                })
        } else {
            Ok(builder.sign(&self.secret_seed))
        }
    }

    // ── Helper: prepare backup delivery for reconnected peer ─────────────

    /// Build SendWithBackupFallback effects for each backed-up message
    /// destined to the given peer.
    fn prepare_backup_delivery(&mut self, peer_id: NodeId) -> Vec<RuntimeEffect> {
        let entries: Vec<(String, Vec<u8>)> = self
            .backup
            .store()
            .get_for_recipient(&peer_id)
            .into_iter()
            .map(|e| (e.message_id.clone(), e.payload.clone()))
            .collect();

        if entries.is_empty() {
            return Vec::new();
        }

        let mut effects = Vec::new();

        for (message_id, payload) in entries {
            let via = self.relay_selector.select_path(peer_id, &self.topology);
            let envelope = match self.build_signed_envelope(peer_id, payload, via) {
                Ok(env) => env,
                Err(_) => continue,
            };

            // On success: emit BackupDelivered.
            // On failure: no action (message stays in backup store).
            let on_success = vec![RuntimeEffect::Emit(ProtocolEvent::BackupDelivered {
                message_id,
                recipient_id: peer_id,
            })];
            let on_failure = Vec::new();

            effects.push(RuntimeEffect::SendWithBackupFallback {
                envelope,
                on_success,
                on_failure,
            });
        }

        effects
    }

    // ── Helper: store an outgoing message for an offline recipient ───────

    /// The recipient is known offline — stash the message in the backup
    /// store instead of attempting a send that can't succeed. Delivery is
    /// driven later by `prepare_backup_delivery` once the peer reconnects.
    fn store_for_backup(&mut self, to: NodeId, payload: Vec<u8>, now: u64) -> Vec<RuntimeEffect> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let actions = self
            .backup
            .store_message(message_id, payload, to, self.local_id, now, None);
        self.translate_backup_actions(actions)
    }

    // ── Incoming envelopes ───────────────────────────────────────────────

    /// Decode, verify, and dispatch a raw envelope received from the wire.
    pub fn handle_incoming(&mut self, data: &[u8], now: u64) -> Vec<RuntimeEffect> {
        let mut envelope = match Envelope::from_bytes(data) {
            Ok(env) => env,
            Err(e) => {
                return vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                    description: format!("malformed envelope: {e}"),
                })]
            }
        };

        if let Err(e) = envelope.verify_signature() {
            return vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                description: format!("signature verification failed: {e}"),
            })];
        }

        // Backup protocol messages are explicitly addressed via
        // SendEnvelopeTo and bypass the router entirely: `to` names the
        // backup subject (the offline recipient), not necessarily us.
        if is_backup_message(envelope.msg_type) {
            return self.handle_backup_envelope(
                envelope.msg_type,
                &envelope.payload,
                envelope.to,
                envelope.from,
                now,
            );
        }

        if envelope.to == self.local_id && envelope.encrypted {
            if let Err(e) = envelope.decrypt_payload(&self.secret_seed) {
                return vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                    description: format!("decryption failed: {e}"),
                })];
            }
        }

        if is_group_message(envelope.msg_type) {
            return match rmp_serde::from_slice::<GroupPayload>(&envelope.payload) {
                Ok(payload) => self.handle_group_envelope(payload, envelope.from),
                Err(e) => vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                    description: format!("malformed group payload: {e}"),
                })],
            };
        }

        match envelope.msg_type {
            MessageType::Heartbeat | MessageType::PresenceJoin => {
                self.heartbeat.record_heartbeat_at(envelope.from, now);
                Vec::new()
            }
            MessageType::PresenceLeave => self.handle_presence_leave(envelope.from),
            MessageType::PeerAnnounce => {
                match rmp_serde::from_slice::<PeerAnnounce>(&envelope.payload) {
                    Ok(announce) => self.handle_peer_announce(announce, now),
                    Err(_) => Vec::new(),
                }
            }
            // Never declared in any module tree — dead on the wire.
            MessageType::RoleAssign => Vec::new(),
            _ => self.handle_routed_envelope(envelope, now),
        }
    }

    /// Feed an envelope addressed to us (or passing through) to the router
    /// and translate its decision into effects.
    fn handle_routed_envelope(&mut self, envelope: Envelope, now: u64) -> Vec<RuntimeEffect> {
        match self.router.route(envelope) {
            RoutingAction::Deliver { envelope, response } => {
                let delivered = DeliveredMessage {
                    from: envelope.from,
                    payload: envelope.payload,
                    envelope_id: envelope.id,
                    timestamp: envelope.timestamp,
                    signature_valid: true,
                    was_encrypted: envelope.encrypted,
                };
                vec![
                    RuntimeEffect::DeliverMessage(delivered),
                    RuntimeEffect::SendEnvelope(self.sign_unsigned(response)),
                ]
            }
            RoutingAction::Forward {
                envelope,
                next_hop,
                relay_ack,
            } => vec![
                RuntimeEffect::SendEnvelopeTo {
                    target: next_hop,
                    envelope,
                },
                RuntimeEffect::SendEnvelope(self.sign_unsigned(relay_ack)),
            ],
            RoutingAction::Ack {
                original_message_id,
                ack_type,
                from,
            } => {
                let change = match ack_type {
                    AckType::RelayForwarded => self.tracker.mark_relayed(&original_message_id),
                    AckType::RecipientReceived => self.tracker.mark_delivered(&original_message_id),
                };
                let mut effects: Vec<RuntimeEffect> =
                    change.into_iter().map(RuntimeEffect::StatusChange).collect();

                if ack_type == AckType::RecipientReceived {
                    let confirm_actions = self
                        .backup
                        .confirm_delivery(std::slice::from_ref(&original_message_id), from);
                    effects.extend(self.translate_backup_actions(confirm_actions));

                    if let Some(event) = self.direct_path.record_relayed_success(from, now) {
                        effects.extend(self.translate_direct_path_event(event));
                    }
                }

                effects
            }
            RoutingAction::ReadReceipt {
                original_message_id,
                ..
            } => self
                .tracker
                .mark_read(&original_message_id)
                .into_iter()
                .map(RuntimeEffect::StatusChange)
                .collect(),
            RoutingAction::Reject { reason } => {
                vec![RuntimeEffect::Emit(ProtocolEvent::MessageRejected { reason })]
            }
            RoutingAction::Drop => Vec::new(),
        }
    }

    /// Router-produced ACK/relay-ack envelopes come back unsigned; sign
    /// before handing them to the transport.
    fn sign_unsigned(&self, mut envelope: Envelope) -> Envelope {
        envelope.sign(&self.secret_seed);
        envelope
    }

    fn handle_peer_announce(&mut self, announce: PeerAnnounce, now: u64) -> Vec<RuntimeEffect> {
        if !announce.is_timestamp_valid(now) {
            return Vec::new();
        }

        let roles: std::collections::HashSet<PeerRole> = if announce.roles.is_empty() {
            std::collections::HashSet::from([PeerRole::Client])
        } else {
            announce.roles.iter().copied().collect()
        };
        let mut info = PeerInfo::new(announce.node_id, PeerRole::Client, PeerStatus::Online, now);
        info.roles = roles;
        info.username = announce.username.clone();
        self.topology.upsert(info);
        self.heartbeat.record_heartbeat_with_source(
            announce.node_id,
            DiscoverySource::Announce,
            announce.username.clone(),
        );

        vec![RuntimeEffect::Emit(ProtocolEvent::PeerAnnounceReceived {
            node_id: announce.node_id,
            username: announce.username,
        })]
    }

    /// An explicit `presence:leave` — the only event allowed to delete a
    /// `PeerInfo` outright. Heartbeat timeouts only ever flip status.
    fn handle_presence_leave(&mut self, node_id: NodeId) -> Vec<RuntimeEffect> {
        self.topology.remove(&node_id);
        self.heartbeat.untrack_peer(&node_id);
        let subnet_events = self.subnets.remove_node(&node_id);
        self.role_manager.remove_node(&node_id);
        self.direct_path.remove(&node_id);

        let mut effects: Vec<RuntimeEffect> = subnet_events
            .iter()
            .flat_map(|e| self.surface_subnet_event(e))
            .collect();
        effects.push(RuntimeEffect::Emit(ProtocolEvent::PeerLeft { node_id }));
        effects
    }

    // ── Group dispatch ───────────────────────────────────────────────────

    /// Route a decoded `GroupPayload` to the hub (if we host that group, or
    /// it's a group-creation request) or to the member-side manager.
    fn handle_group_envelope(&mut self, payload: GroupPayload, from: NodeId) -> Vec<RuntimeEffect> {
        let we_host = group_payload_group_id(&payload)
            .map(|id| self.group_hub.get_group(&id).is_some())
            .unwrap_or(false);

        let actions = if matches!(payload, GroupPayload::Create { .. }) || we_host {
            self.group_hub.handle_payload(payload, from)
        } else {
            self.dispatch_to_group_manager(payload, from)
        };

        self.translate_group_actions(actions)
    }

    fn dispatch_to_group_manager(&mut self, payload: GroupPayload, from: NodeId) -> Vec<GroupAction> {
        match payload {
            GroupPayload::Created { group } => {
                self.group_manager.handle_group_created(group);
                Vec::new()
            }
            GroupPayload::Invite {
                group_id,
                group_name,
                inviter_id,
                inviter_username,
            } => self
                .group_manager
                .handle_invite(group_id, group_name, inviter_id, inviter_username, from),
            GroupPayload::Sync {
                group,
                recent_messages,
            } => self.group_manager.handle_group_sync(group, recent_messages),
            GroupPayload::Message(message) => self.group_manager.handle_message(message),
            GroupPayload::MemberJoined { group_id, member } => {
                self.group_manager.handle_member_joined(&group_id, member)
            }
            GroupPayload::MemberLeft {
                group_id,
                node_id,
                username,
                reason,
            } => self
                .group_manager
                .handle_member_left(&group_id, &node_id, username, reason),
            GroupPayload::HubMigration {
                group_id,
                new_hub_id,
                ..
            } => self.group_manager.handle_hub_migration(&group_id, new_hub_id),
            GroupPayload::SenderKeyDistribution {
                group_id,
                from: sender,
                epoch,
                encrypted_keys,
            } => self.group_manager.handle_sender_key_distribution(
                &group_id,
                sender,
                epoch,
                &encrypted_keys,
                &self.secret_seed,
            ),
            // Hub-only variants arriving while we're not (or no longer) the
            // hub for that group: nothing for the member side to do.
            GroupPayload::Create { .. }
            | GroupPayload::Join { .. }
            | GroupPayload::Leave { .. }
            | GroupPayload::DeliveryAck { .. }
            | GroupPayload::HubHeartbeat { .. } => Vec::new(),
        }
    }

    fn build_group_envelope_effect(&self, to: NodeId, payload: &GroupPayload) -> Option<RuntimeEffect> {
        let bytes = rmp_serde::to_vec(payload).ok()?;
        let msg_type = group_payload_msg_type(payload);
        let via = self.relay_selector.select_path(to, &self.topology);
        let envelope = EnvelopeBuilder::new(self.local_id, to, msg_type, bytes)
            .via(via)
            .sign(&self.secret_seed);
        Some(RuntimeEffect::SendEnvelope(envelope))
    }

    fn translate_group_actions(&mut self, actions: Vec<GroupAction>) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                GroupAction::Send { to, payload } => {
                    effects.extend(self.build_group_envelope_effect(to, &payload));
                }
                GroupAction::Broadcast { to, payload } => {
                    for target in to {
                        effects.extend(self.build_group_envelope_effect(target, &payload));
                    }
                }
                GroupAction::Event(event) => {
                    effects.push(RuntimeEffect::Emit(Self::translate_group_event(event)));
                }
                GroupAction::None => {}
            }
        }
        effects
    }

    fn translate_group_event(event: GroupEvent) -> ProtocolEvent {
        match event {
            GroupEvent::GroupCreated(group) => ProtocolEvent::GroupCreated { group },
            GroupEvent::InviteReceived(invite) => ProtocolEvent::GroupInviteReceived { invite },
            GroupEvent::Joined {
                group_id,
                group_name,
            } => ProtocolEvent::GroupJoined {
                group_id,
                group_name,
            },
            GroupEvent::MemberJoined { group_id, member } => {
                ProtocolEvent::GroupMemberJoined { group_id, member }
            }
            GroupEvent::MemberLeft {
                group_id,
                node_id,
                username,
                reason,
            } => ProtocolEvent::GroupMemberLeft {
                group_id,
                node_id,
                username,
                reason,
            },
            GroupEvent::MessageReceived(message) => {
                ProtocolEvent::GroupMessageReceived { message }
            }
            GroupEvent::HubMigrated {
                group_id,
                new_hub_id,
            } => ProtocolEvent::GroupHubMigrated {
                group_id,
                new_hub_id,
            },
            GroupEvent::SecurityViolation {
                group_id,
                node_id,
                reason,
            } => ProtocolEvent::GroupSecurityViolation {
                group_id,
                node_id,
                reason,
            },
        }
    }

    // ── Backup dispatch ──────────────────────────────────────────────────

    /// `subject` is the envelope's `to` field: the peer whose backups are
    /// concerned (not necessarily us). `from` is who sent this envelope.
    fn handle_backup_envelope(
        &mut self,
        msg_type: MessageType,
        data: &[u8],
        subject: NodeId,
        from: NodeId,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        match msg_type {
            MessageType::BackupQuery => {
                let ids: Vec<String> = self
                    .backup
                    .store()
                    .get_for_recipient(&subject)
                    .into_iter()
                    .map(|e| e.message_id.clone())
                    .collect();
                if ids.is_empty() {
                    return Vec::new();
                }
                let response = BackupQueryResponsePayload { message_ids: ids };
                let Ok(bytes) = rmp_serde::to_vec(&response) else {
                    return Vec::new();
                };
                let envelope =
                    EnvelopeBuilder::new(self.local_id, subject, MessageType::BackupQueryResponse, bytes)
                        .sign(&self.secret_seed);
                vec![RuntimeEffect::SendEnvelopeTo {
                    target: from,
                    envelope,
                }]
            }
            MessageType::BackupQueryResponse => {
                match rmp_serde::from_slice::<BackupQueryResponsePayload>(data) {
                    Ok(resp) => {
                        self.backup
                            .handle_query_response(&subject, &resp.message_ids, now);
                        Vec::new()
                    }
                    Err(_) => Vec::new(),
                }
            }
            MessageType::BackupReplicate => match rmp_serde::from_slice::<ReplicationPayload>(data) {
                Ok(payload) => {
                    let message_id = payload.message_id.clone();
                    let actions = self.backup.handle_replication(&payload, from, now);
                    let mut effects = self.translate_backup_actions(actions);
                    let ack = BackupReplicateAckPayload { message_id };
                    if let Ok(bytes) = rmp_serde::to_vec(&ack) {
                        let envelope = EnvelopeBuilder::new(
                            self.local_id,
                            from,
                            MessageType::BackupReplicateAck,
                            bytes,
                        )
                        .sign(&self.secret_seed);
                        effects.push(RuntimeEffect::SendEnvelopeTo {
                            target: from,
                            envelope,
                        });
                    }
                    effects
                }
                Err(_) => Vec::new(),
            },
            MessageType::BackupReplicateAck => {
                match rmp_serde::from_slice::<BackupReplicateAckPayload>(data) {
                    Ok(ack) => {
                        let actions = self.backup.handle_replication_ack(&ack.message_id, from);
                        self.translate_backup_actions(actions)
                    }
                    Err(_) => Vec::new(),
                }
            }
            MessageType::BackupConfirmDelivery => {
                match rmp_serde::from_slice::<BackupConfirmDeliveryPayload>(data) {
                    Ok(confirm) => {
                        let actions = self.backup.handle_delivery_confirmation(&confirm.message_ids);
                        self.translate_backup_actions(actions)
                    }
                    Err(_) => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn translate_backup_actions(&mut self, actions: Vec<BackupAction>) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                BackupAction::Replicate { target, payload } => {
                    if let Ok(bytes) = rmp_serde::to_vec(&payload) {
                        let envelope =
                            EnvelopeBuilder::new(self.local_id, target, MessageType::BackupReplicate, bytes)
                                .sign(&self.secret_seed);
                        effects.push(RuntimeEffect::SendEnvelope(envelope));
                    }
                }
                BackupAction::ConfirmDelivery {
                    message_ids,
                    recipient_id: _,
                    targets,
                } => {
                    if !targets.is_empty() {
                        let payload = BackupConfirmDeliveryPayload {
                            message_ids: message_ids.clone(),
                        };
                        if let Ok(bytes) = rmp_serde::to_vec(&payload) {
                            for target in targets {
                                let envelope = EnvelopeBuilder::new(
                                    self.local_id,
                                    target,
                                    MessageType::BackupConfirmDelivery,
                                    bytes.clone(),
                                )
                                .sign(&self.secret_seed);
                                effects.push(RuntimeEffect::SendEnvelope(envelope));
                            }
                        }
                    }
                }
                BackupAction::QueryPending { recipient_id } => {
                    let payload = BackupQueryPayload::default();
                    if let Ok(bytes) = rmp_serde::to_vec(&payload) {
                        let envelope = EnvelopeBuilder::new(
                            self.local_id,
                            recipient_id,
                            MessageType::BackupQuery,
                            bytes,
                        )
                        .sign(&self.secret_seed);
                        for peer in self.topology.peers() {
                            if peer.status == PeerStatus::Online && peer.node_id != self.local_id {
                                effects.push(RuntimeEffect::SendEnvelopeTo {
                                    target: peer.node_id,
                                    envelope: envelope.clone(),
                                });
                            }
                        }
                    }
                }
                BackupAction::Event(event) => {
                    if let Some(proto_event) = Self::translate_backup_event(event) {
                        effects.push(RuntimeEffect::Emit(proto_event));
                    }
                }
            }
        }
        effects
    }

    fn translate_backup_event(event: BackupEvent) -> Option<ProtocolEvent> {
        match event {
            BackupEvent::MessageStored {
                message_id,
                recipient_id,
            } => Some(ProtocolEvent::BackupStored {
                message_id,
                recipient_id,
            }),
            BackupEvent::MessageExpired {
                message_id,
                recipient_id,
            } => Some(ProtocolEvent::BackupExpired {
                message_id,
                recipient_id,
            }),
            BackupEvent::MessageDelivered {
                message_id,
                recipient_id,
            } => Some(ProtocolEvent::BackupDelivered {
                message_id,
                recipient_id,
            }),
            // Consumed directly by `tick_backup`; no app-facing event.
            BackupEvent::ReplicationNeeded { .. } | BackupEvent::SelfDeleteRecommended { .. } => None,
            BackupEvent::MessageReplicated { .. } => None,
        }
    }

    fn translate_direct_path_event(&self, event: DirectPathEvent) -> Option<RuntimeEffect> {
        let proto_event = match event {
            DirectPathEvent::Lost { peer } => ProtocolEvent::DirectPathLost { peer },
            DirectPathEvent::Restored { peer } => ProtocolEvent::DirectPathRestored { peer },
        };
        Some(RuntimeEffect::Emit(proto_event))
    }

    fn pick_replication_target(&self) -> Option<NodeId> {
        self.topology
            .peers()
            .filter(|p| p.status == PeerStatus::Online && p.node_id != self.local_id)
            .max_by_key(|p| p.last_seen)
            .map(|p| p.node_id)
    }

    // ── Outgoing commands ────────────────────────────────────────────────

    /// Handle a command from the application. Commands with a oneshot reply
    /// (`GetConnectedPeers`, `GetGroups`, `GetPendingInvites`) and
    /// `Shutdown` are handled directly by the event loop, which has access
    /// to the reply channels — they are no-ops here.
    pub fn handle_command(&mut self, cmd: RuntimeCommand, now: u64) -> Vec<RuntimeEffect> {
        match cmd {
            RuntimeCommand::SendMessage { to, payload } => self.send_chat(to, payload, now),
            RuntimeCommand::SendReadReceipt {
                to,
                original_message_id,
            } => self.send_read_receipt(to, original_message_id),
            RuntimeCommand::AddPeer { node_id } => {
                self.heartbeat.track_peer(node_id);
                Vec::new()
            }
            RuntimeCommand::UpsertPeer { info } => {
                self.topology.upsert(info);
                Vec::new()
            }
            RuntimeCommand::RemovePeer { node_id } => {
                self.topology.remove(&node_id);
                let subnet_events = self.subnets.remove_node(&node_id);
                self.role_manager.remove_node(&node_id);
                self.direct_path.remove(&node_id);
                subnet_events
                    .iter()
                    .flat_map(|e| self.surface_subnet_event(e))
                    .collect()
            }
            RuntimeCommand::CreateGroup {
                name,
                hub_relay_id,
                initial_members,
            } => {
                let actions = self
                    .group_manager
                    .create_group(&name, hub_relay_id, initial_members);
                self.translate_group_actions(actions)
            }
            RuntimeCommand::AcceptInvite { group_id } => {
                let actions = self.group_manager.accept_invite(&group_id);
                self.translate_group_actions(actions)
            }
            RuntimeCommand::DeclineInvite { group_id } => {
                self.group_manager.decline_invite(&group_id);
                Vec::new()
            }
            RuntimeCommand::LeaveGroup { group_id } => {
                let actions = self.group_manager.leave_group(&group_id);
                self.translate_group_actions(actions)
            }
            RuntimeCommand::SendGroupMessage { group_id, text } => {
                self.send_group_message(group_id, text)
            }
            RuntimeCommand::GetConnectedPeers { .. }
            | RuntimeCommand::GetGroups { .. }
            | RuntimeCommand::GetPendingInvites { .. }
            | RuntimeCommand::Shutdown => Vec::new(),
        }
    }

    /// Send a chat message, preferring a direct channel over relaying when
    /// one is open, and arranging a single reroute attempt if the first hop
    /// fails. A recipient already known offline skips the send attempt
    /// entirely and goes straight to backup storage.
    fn send_chat(&mut self, to: NodeId, payload: Vec<u8>, now: u64) -> Vec<RuntimeEffect> {
        if matches!(self.topology.get(&to), Some(info) if info.status == PeerStatus::Offline) {
            return self.store_for_backup(to, payload, now);
        }

        let direct = self.direct_path.is_direct_available(&to);
        let via = if direct {
            Vec::new()
        } else {
            self.relay_selector.select_path(to, &self.topology)
        };

        let envelope = match self.build_signed_envelope(to, payload.clone(), via.clone()) {
            Ok(env) => env,
            Err(effect) => return vec![effect],
        };

        let mut effects = Vec::new();
        if let Some(change) = self.tracker.track(envelope.id.clone(), to) {
            effects.push(RuntimeEffect::StatusChange(change));
        }
        if let Some(change) = self.tracker.mark_sent(&envelope.id) {
            effects.push(RuntimeEffect::StatusChange(change));
        }

        // If the first hop fails: a direct attempt falls back to relaying;
        // a relay attempt falls back to an alternate relay, excluding the
        // one that just failed.
        let alternate = if direct {
            let relay_via = self.relay_selector.select_path(to, &self.topology);
            self.build_signed_envelope(to, payload, relay_via).ok()
        } else if !via.is_empty() {
            self.relay_selector
                .select_alternate(to, &self.topology, &via)
                .relay_id
                .and_then(|relay| self.build_signed_envelope(to, payload, vec![relay]).ok())
        } else {
            None
        };

        effects.push(RuntimeEffect::SendWithReroute { envelope, alternate });
        effects
    }

    fn send_read_receipt(&mut self, to: NodeId, original_message_id: String) -> Vec<RuntimeEffect> {
        let payload = ReadReceiptPayload {
            original_message_id,
            read_at: now_ms(),
        }
        .to_bytes();
        let via = self.relay_selector.select_path(to, &self.topology);
        let envelope = EnvelopeBuilder::new(self.local_id, to, MessageType::ReadReceipt, payload)
            .via(via)
            .sign(&self.secret_seed);
        vec![RuntimeEffect::SendEnvelope(envelope)]
    }

    fn send_group_message(&mut self, group_id: crate::group::GroupId, text: String) -> Vec<RuntimeEffect> {
        let Some(group) = self.group_manager.get_group(&group_id) else {
            return vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                description: format!("not a member of group {group_id}"),
            })];
        };
        let hub_relay_id = group.hub_relay_id;

        let mut message = match self.group_manager.local_sender_key(&group_id) {
            Some(key) => GroupMessage::new_encrypted(
                group_id.clone(),
                self.local_id,
                self.config.username.clone(),
                text,
                &key.key,
                key.epoch,
            ),
            None => GroupMessage::new(
                group_id.clone(),
                self.local_id,
                self.config.username.clone(),
                text,
            ),
        };
        message.sign(&self.secret_seed);

        let payload = GroupPayload::Message(message);
        self.build_group_envelope_effect(hub_relay_id, &payload)
            .into_iter()
            .collect()
    }

    // ── Tick: group hub heartbeat ────────────────────────────────────────

    pub fn tick_group_hub_heartbeat(&mut self) -> Vec<RuntimeEffect> {
        let actions = self.group_hub.heartbeat_actions();
        self.translate_group_actions(actions)
    }

    // ── Tick: backup maintenance ─────────────────────────────────────────

    /// Run one backup maintenance cycle: expire, check viability, and react
    /// to the events that fall out (replicate when viability drops, delete
    /// when it bottoms out).
    pub fn tick_backup(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let actions = self.backup.tick(now);
        let mut effects = Vec::new();
        for action in actions {
            match action {
                BackupAction::Event(BackupEvent::ReplicationNeeded { message_id, .. }) => {
                    if let Some(target) = self.pick_replication_target() {
                        let replicate_actions = self.backup.replicate_to(&message_id, target, now);
                        effects.extend(self.translate_backup_actions(replicate_actions));
                    }
                }
                BackupAction::Event(BackupEvent::SelfDeleteRecommended { message_id, .. }) => {
                    self.backup.store_mut().delete(&message_id);
                }
                other => effects.extend(self.translate_backup_actions(vec![other])),
            }
        }
        effects
    }

    // ── Tick: ephemeral subnets ───────────────────────────────────────────

    pub fn tick_subnets(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let events = self.subnets.evaluate(now);
        events
            .iter()
            .flat_map(|e| self.surface_subnet_event(e))
            .collect()
    }

    // ── Tick: role evaluation ─────────────────────────────────────────────

    pub fn tick_roles(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let actions = self.role_manager.evaluate(&mut self.topology, now);
        actions
            .into_iter()
            .map(|action| {
                RuntimeEffect::Emit(match action {
                    RoleAction::Promoted { node_id, score } => {
                        ProtocolEvent::RolePromoted { node_id, score }
                    }
                    RoleAction::Demoted { node_id, score } => {
                        ProtocolEvent::RoleDemoted { node_id, score }
                    }
                    RoleAction::LocalRoleChanged { new_role } => {
                        self.local_roles = vec![new_role];
                        ProtocolEvent::LocalRoleChanged { new_role }
                    }
                })
            })
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
