//! Service front-end: the leader-only client-facing operations, backed by a
//! single coarse-mutex authoritative state (`ClientRecords`, `Groups`,
//! `Votes`), plus the vote-deadline scheduler and the request-id de-dup
//! cache.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::multicast::{ClientDirectory, MulticastHandle};
use crate::replication::{ReplicationHandle, StateApplier};
use crate::types::{ClientId, ClientRecord, Group, NodeId, Token, Vote, VoteId, VoteState};
use crate::wire::{McastPayload, ReplKind, ReplicatedState, ServiceErrorCode, ServiceOp, ServiceReply, ServiceRequest, ServiceResult, VoteMeta};

const DEDUP_CACHE_SIZE: usize = 16;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The authoritative state §5 calls out as guarded by one coarse mutex.
#[derive(Default)]
struct Inner {
    clients: HashMap<ClientId, ClientRecord>,
    groups: HashMap<String, Group>,
    votes: HashMap<VoteId, Vote>,
    next_client_id: ClientId,
    next_vote_id: VoteId,
}

/// Leader-only (but harmless if constructed on a follower — it simply never
/// receives client traffic; see server.rs's PROTOCOL_UNEXPECTED redirect
/// logic) authoritative state plus its replication/multicast collaborators.
///
/// Concurrency note: §5 designates a single client-request worker task, so
/// the check-then-act sequences below (e.g. "group name free?" then
/// "create it") are race-free in practice even though `inner` uses an async
/// mutex rather than requiring external single-threading — the mutex is
/// defense in depth, not the sole correctness mechanism.
pub struct ServiceState {
    me: NodeId,
    inner: Mutex<Inner>,
    dedup: Mutex<HashMap<ClientId, VecDeque<(u64, ServiceResult)>>>,
    pending_registrations: Mutex<HashMap<NodeId, VecDeque<(u64, ServiceResult)>>>,
    repl: ReplicationHandle,
    mcast: MulticastHandle,
    vote_deadlines: mpsc::UnboundedSender<(u64, VoteId)>,
}

impl ServiceState {
    pub fn new(
        me: NodeId,
        repl: ReplicationHandle,
        mcast: MulticastHandle,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(u64, VoteId)>) {
        let (vote_deadlines, deadlines_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ServiceState {
            me,
            inner: Mutex::new(Inner::default()),
            dedup: Mutex::new(HashMap::new()),
            pending_registrations: Mutex::new(HashMap::new()),
            repl,
            mcast,
            vote_deadlines,
        });
        (state, deadlines_rx)
    }

    pub async fn handle_request(&self, req: ServiceRequest) -> ServiceReply {
        let result = self.dispatch(&req).await;
        ServiceReply {
            request_id: req.request_id,
            result,
        }
    }

    async fn dispatch(&self, req: &ServiceRequest) -> ServiceResult {
        if let ServiceOp::Register { address } = &req.op {
            return self.do_register(req.request_id, *address).await;
        }

        let Some(client_id) = req.client_id else {
            return auth_failed("missing client id");
        };
        if let Some(cached) = self.cached_reply(client_id, req.request_id).await {
            return cached;
        }
        let client_id = match self.authenticate(req.client_id, req.token).await {
            Ok(id) => id,
            Err(code) => return ServiceResult::Error { code, message: "unknown token".into() },
        };

        let result = match &req.op {
            ServiceOp::Register { .. } => unreachable!("handled above"),
            ServiceOp::CreateGroup { name } => self.do_create_group(client_id, name.clone()).await,
            ServiceOp::JoinGroup { name } => self.do_join_group(client_id, name.clone()).await,
            ServiceOp::LeaveGroup { name } => self.do_leave_group(client_id, name.clone()).await,
            ServiceOp::StartVote { group, topic, options, timeout_ms } => {
                self.do_start_vote(client_id, group.clone(), topic.clone(), options.clone(), *timeout_ms)
                    .await
            }
            ServiceOp::CastBallot { vote_id, option_index } => {
                self.do_cast_ballot(client_id, *vote_id, *option_index).await
            }
        };
        self.store_reply(client_id, req.request_id, result.clone()).await;
        result
    }

    async fn cached_reply(&self, client: ClientId, request_id: u64) -> Option<ServiceResult> {
        let dedup = self.dedup.lock().await;
        dedup
            .get(&client)?
            .iter()
            .find(|(id, _)| *id == request_id)
            .map(|(_, r)| r.clone())
    }

    async fn store_reply(&self, client: ClientId, request_id: u64, result: ServiceResult) {
        let mut dedup = self.dedup.lock().await;
        let entry = dedup.entry(client).or_default();
        entry.push_back((request_id, result));
        while entry.len() > DEDUP_CACHE_SIZE {
            entry.pop_front();
        }
    }

    async fn authenticate(
        &self,
        client_id: Option<ClientId>,
        token: Option<Token>,
    ) -> Result<ClientId, ServiceErrorCode> {
        let (cid, tok) = match (client_id, token) {
            (Some(c), Some(t)) => (c, t),
            _ => return Err(ServiceErrorCode::AuthFailed),
        };
        let inner = self.inner.lock().await;
        match inner.clients.get(&cid) {
            Some(rec) if rec.token == tok => Ok(cid),
            _ => Err(ServiceErrorCode::AuthFailed),
        }
    }

    async fn do_register(&self, request_id: u64, address: NodeId) -> ServiceResult {
        {
            let pending = self.pending_registrations.lock().await;
            if let Some(cached) = pending
                .get(&address)
                .and_then(|entries| entries.iter().find(|(id, _)| *id == request_id))
                .map(|(_, r)| r.clone())
            {
                return cached;
            }
        }

        let client_id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_client_id;
            inner.next_client_id += 1;
            id
        };
        let token: Token = rand::random();
        let record = ClientRecord { id: client_id, address, token };

        self.apply_kind(&ReplKind::ClientRegister(record.clone())).await;
        if let Err(e) = self.repl.submit(ReplKind::ClientRegister(record)).await {
            pf_warn!("replication of client registration failed: {}", e);
        }

        let result = ServiceResult::Registered { client_id, token, leader_id: self.me };
        let mut pending = self.pending_registrations.lock().await;
        let entry = pending.entry(address).or_default();
        entry.push_back((request_id, result.clone()));
        while entry.len() > DEDUP_CACHE_SIZE {
            entry.pop_front();
        }
        result
    }

    async fn do_create_group(&self, creator: ClientId, name: String) -> ServiceResult {
        {
            let inner = self.inner.lock().await;
            if inner.groups.contains_key(&name) {
                return ServiceResult::Error {
                    code: ServiceErrorCode::NameTaken,
                    message: format!("group '{}' already exists", name),
                };
            }
        }

        let kind = ReplKind::GroupCreate { name: name.clone(), creator };
        self.apply_kind(&kind).await;
        if let Err(e) = self.repl.submit(kind).await {
            pf_warn!("replication of group creation failed: {}", e);
        }
        self.mcast.set_members(name, vec![creator]);
        ServiceResult::GroupCreated
    }

    async fn do_join_group(&self, client_id: ClientId, name: String) -> ServiceResult {
        {
            let inner = self.inner.lock().await;
            if !inner.groups.contains_key(&name) {
                return ServiceResult::Error {
                    code: ServiceErrorCode::NoSuchGroup,
                    message: format!("no such group '{}'", name),
                };
            }
        }

        let kind = ReplKind::GroupJoin { name: name.clone(), client: client_id };
        self.apply_kind(&kind).await;
        if let Err(e) = self.repl.submit(kind).await {
            pf_warn!("replication of group join failed: {}", e);
        }

        let members = {
            let inner = self.inner.lock().await;
            inner.groups.get(&name).map(|g| g.members.clone()).unwrap_or_default()
        };
        self.mcast.set_members(name.clone(), members);
        let fo_seq = self.mcast.current_seq(name).await;
        ServiceResult::Joined { fo_seq }
    }

    async fn do_leave_group(&self, client_id: ClientId, name: String) -> ServiceResult {
        {
            let inner = self.inner.lock().await;
            match inner.groups.get(&name) {
                None => {
                    return ServiceResult::Error {
                        code: ServiceErrorCode::NoSuchGroup,
                        message: format!("no such group '{}'", name),
                    }
                }
                Some(g) if !g.is_member(client_id) => {
                    return ServiceResult::Error {
                        code: ServiceErrorCode::NotMember,
                        message: "not a member of this group".into(),
                    }
                }
                _ => {}
            }
        }

        let kind = ReplKind::GroupLeave { name: name.clone(), client: client_id };
        self.apply_kind(&kind).await;
        if let Err(e) = self.repl.submit(kind).await {
            pf_warn!("replication of group leave failed: {}", e);
        }

        let members = {
            let inner = self.inner.lock().await;
            inner.groups.get(&name).map(|g| g.members.clone()).unwrap_or_default()
        };
        self.mcast.set_members(name, members);
        ServiceResult::Left
    }

    async fn do_start_vote(
        &self,
        client_id: ClientId,
        group: String,
        topic: String,
        options: Vec<String>,
        timeout_ms: u64,
    ) -> ServiceResult {
        {
            let inner = self.inner.lock().await;
            match inner.groups.get(&group) {
                None => {
                    return ServiceResult::Error {
                        code: ServiceErrorCode::NotMember,
                        message: format!("no such group '{}'", group),
                    }
                }
                Some(g) if !g.is_member(client_id) => {
                    return ServiceResult::Error {
                        code: ServiceErrorCode::NotMember,
                        message: "not a member of this group".into(),
                    }
                }
                _ => {}
            }
            if options.is_empty() {
                return ServiceResult::Error {
                    code: ServiceErrorCode::BadOptions,
                    message: "a vote needs at least one option".into(),
                };
            }
        }

        let vote_id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_vote_id;
            inner.next_vote_id += 1;
            id
        };
        let deadline_ms = now_ms() + timeout_ms;
        let meta = VoteMeta { vote_id, group: group.clone(), topic, options, deadline_ms };

        self.apply_kind(&ReplKind::VoteStart(meta.clone())).await;
        if let Err(e) = self.repl.submit(ReplKind::VoteStart(meta.clone())).await {
            pf_warn!("replication of vote start failed: {}", e);
        }
        let _ = self.vote_deadlines.send((deadline_ms, vote_id));
        let _ = self.mcast.send(group, McastPayload::VoteOpen(meta)).await;

        ServiceResult::VoteStarted { vote_id }
    }

    async fn do_cast_ballot(&self, client_id: ClientId, vote_id: VoteId, option_index: usize) -> ServiceResult {
        let (group_name, member_count);
        {
            let inner = self.inner.lock().await;
            let Some(v) = inner.votes.get(&vote_id) else {
                return ServiceResult::Error {
                    code: ServiceErrorCode::NoSuchVote,
                    message: "no such vote".into(),
                };
            };
            if v.state == VoteState::Closed {
                return ServiceResult::Error {
                    code: ServiceErrorCode::VoteClosed,
                    message: "vote already closed".into(),
                };
            }
            if option_index >= v.options.len() {
                return ServiceResult::Error {
                    code: ServiceErrorCode::BadOptions,
                    message: "option index out of range".into(),
                };
            }
            if v.ballots.contains_key(&client_id) {
                return ServiceResult::Duplicate;
            }
            group_name = v.group.clone();
            member_count = inner.groups.get(&group_name).map(|g| g.members.len()).unwrap_or(0);
        }

        let kind = ReplKind::VoteBallot { vote_id, client: client_id, option_index };
        self.apply_kind(&kind).await;
        if let Err(e) = self.repl.submit(kind).await {
            pf_warn!("replication of ballot failed: {}", e);
        }
        let _ = self
            .mcast
            .send(group_name, McastPayload::BallotCounted { vote_id, client: client_id, option_index })
            .await;

        let ballot_count = {
            let inner = self.inner.lock().await;
            inner.votes.get(&vote_id).map(|v| v.ballots.len()).unwrap_or(0)
        };
        if member_count > 0 && ballot_count >= member_count {
            self.close_vote(vote_id).await;
        }

        ServiceResult::BallotAccepted
    }

    /// Closes `vote_id` if still open, computing and FO-multicasting the
    /// final tally (§4.7). Called both by [`Self::do_cast_ballot`] (everyone
    /// voted) and the vote-deadline scheduler (deadline reached). Idempotent.
    pub async fn close_vote(&self, vote_id: VoteId) {
        let tally = {
            let mut inner = self.inner.lock().await;
            let Some(v) = inner.votes.get_mut(&vote_id) else { return };
            if v.state == VoteState::Closed {
                return;
            }
            v.close()
        };
        let group_name = {
            let inner = self.inner.lock().await;
            inner.votes.get(&vote_id).map(|v| v.group.clone())
        };
        let Some(group_name) = group_name else { return };

        let kind = ReplKind::VoteClose { vote_id, tally: tally.clone() };
        self.apply_kind(&kind).await;
        if let Err(e) = self.repl.submit(kind).await {
            pf_warn!("replication of vote close failed: {}", e);
        }
        let _ = self.mcast.send(group_name, McastPayload::VoteResult { vote_id, tally: tally.clone() }).await;
        pf_info!("vote {} closed, winner '{}'", vote_id, tally.winner);
    }

    /// Applies one replicated op to local authoritative state. Used both by
    /// the leader itself (synchronously, right before calling
    /// [`ReplicationHandle::submit`], per §4.5) and by followers via the
    /// [`StateApplier`] impl below.
    async fn apply_kind(&self, kind: &ReplKind) {
        let mut inner = self.inner.lock().await;
        match kind.clone() {
            ReplKind::ClientRegister(rec) => {
                inner.next_client_id = inner.next_client_id.max(rec.id + 1);
                inner.clients.insert(rec.id, rec);
            }
            ReplKind::GroupCreate { name, creator } => {
                inner.groups.entry(name.clone()).or_insert_with(|| Group::new(name, creator));
            }
            ReplKind::GroupJoin { name, client } => {
                if let Some(g) = inner.groups.get_mut(&name) {
                    if !g.members.contains(&client) {
                        g.members.push(client);
                    }
                }
            }
            ReplKind::GroupLeave { name, client } => {
                if let Some(g) = inner.groups.get_mut(&name) {
                    g.members.retain(|&c| c != client);
                }
            }
            ReplKind::VoteStart(meta) => {
                inner.next_vote_id = inner.next_vote_id.max(meta.vote_id + 1);
                let vote = Vote::new(meta.vote_id, meta.group, meta.topic, meta.options, meta.deadline_ms);
                inner.votes.entry(meta.vote_id).or_insert(vote);
            }
            ReplKind::VoteBallot { vote_id, client, option_index } => {
                if let Some(v) = inner.votes.get_mut(&vote_id) {
                    v.cast_ballot(client, option_index);
                }
            }
            ReplKind::VoteClose { vote_id, tally } => {
                if let Some(v) = inner.votes.get_mut(&vote_id) {
                    v.state = VoteState::Closed;
                    v.tally = Some(tally);
                }
            }
        }
    }
}

fn auth_failed(message: &str) -> ServiceResult {
    ServiceResult::Error { code: ServiceErrorCode::AuthFailed, message: message.into() }
}

#[async_trait]
impl StateApplier for ServiceState {
    async fn apply(&self, kind: ReplKind) {
        self.apply_kind(&kind).await;
    }

    async fn snapshot(&self) -> ReplicatedState {
        let inner = self.inner.lock().await;
        ReplicatedState {
            clients: inner.clients.clone(),
            groups: inner.groups.clone(),
            votes: inner.votes.clone(),
            next_client_id: inner.next_client_id,
            next_vote_id: inner.next_vote_id,
        }
    }

    async fn install(&self, state: ReplicatedState) {
        let mut inner = self.inner.lock().await;
        inner.clients = state.clients;
        inner.groups = state.groups;
        inner.votes = state.votes;
        inner.next_client_id = state.next_client_id;
        inner.next_vote_id = state.next_vote_id;
    }
}

#[async_trait]
impl ClientDirectory for ServiceState {
    async fn address_of(&self, client: ClientId) -> Option<NodeId> {
        self.inner.lock().await.clients.get(&client).map(|r| r.address)
    }
}

/// Runs the vote-deadline scheduler (§5 task 7): a priority queue keyed on
/// deadline, woken either by a newly-scheduled vote or by the next deadline
/// elapsing, whichever comes first.
pub async fn run_vote_scheduler(
    service: Arc<ServiceState>,
    mut new_deadlines: mpsc::UnboundedReceiver<(u64, VoteId)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heap: BinaryHeap<Reverse<(u64, VoteId)>> = BinaryHeap::new();

    loop {
        let sleep_for = match heap.peek() {
            Some(Reverse((deadline_ms, _))) => {
                let now = now_ms();
                if *deadline_ms <= now {
                    Duration::ZERO
                } else {
                    Duration::from_millis(deadline_ms - now)
                }
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {
                if let Some(Reverse((deadline_ms, vote_id))) = heap.peek().copied() {
                    if deadline_ms <= now_ms() {
                        heap.pop();
                        service.close_vote(vote_id).await;
                    }
                }
            }
            ev = new_deadlines.recv() => {
                match ev {
                    None => break,
                    Some(entry) => heap.push(Reverse(entry)),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    pf_info!("vote scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicast::MulticastHandle;
    use crate::replication::ReplicationHandle;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(port: u16) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    async fn test_state() -> Arc<ServiceState> {
        let (repl, _repl_rx) = ReplicationHandle::new();
        let (mcast, _mcast_rx) = MulticastHandle::new();
        let (state, _deadlines_rx) = ServiceState::new(node(6001), repl, mcast);
        state
    }

    async fn register(state: &ServiceState, request_id: u64) -> (ClientId, Token) {
        let reply = state
            .handle_request(ServiceRequest {
                request_id,
                client_id: None,
                token: None,
                op: ServiceOp::Register { address: node(7000 + request_id as u16) },
            })
            .await;
        match reply.result {
            ServiceResult::Registered { client_id, token, .. } => (client_id, token),
            other => panic!("unexpected register result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_then_create_and_join_group() {
        let state = test_state().await;
        let (c1, t1) = register(&state, 1).await;
        let (c2, t2) = register(&state, 2).await;
        assert_ne!(c1, c2);

        let reply = state
            .handle_request(ServiceRequest {
                request_id: 3,
                client_id: Some(c1),
                token: Some(t1),
                op: ServiceOp::CreateGroup { name: "g".into() },
            })
            .await;
        assert!(matches!(reply.result, ServiceResult::GroupCreated));

        let reply = state
            .handle_request(ServiceRequest {
                request_id: 4,
                client_id: Some(c2),
                token: Some(t2),
                op: ServiceOp::JoinGroup { name: "g".into() },
            })
            .await;
        assert!(matches!(reply.result, ServiceResult::Joined { fo_seq: 0 }));
    }

    #[tokio::test]
    async fn duplicate_create_group_is_name_taken() {
        let state = test_state().await;
        let (c1, t1) = register(&state, 1).await;
        let create = |rid| ServiceRequest {
            request_id: rid,
            client_id: Some(c1),
            token: Some(t1),
            op: ServiceOp::CreateGroup { name: "g".into() },
        };
        let first = state.handle_request(create(2)).await;
        assert!(matches!(first.result, ServiceResult::GroupCreated));
        let second = state.handle_request(create(3)).await;
        assert!(matches!(
            second.result,
            ServiceResult::Error { code: ServiceErrorCode::NameTaken, .. }
        ));
    }

    #[tokio::test]
    async fn wrong_token_is_auth_failed() {
        let state = test_state().await;
        let (c1, _t1) = register(&state, 1).await;
        let reply = state
            .handle_request(ServiceRequest {
                request_id: 2,
                client_id: Some(c1),
                token: Some(0xdead),
                op: ServiceOp::CreateGroup { name: "g".into() },
            })
            .await;
        assert!(matches!(
            reply.result,
            ServiceResult::Error { code: ServiceErrorCode::AuthFailed, .. }
        ));
    }

    #[tokio::test]
    async fn repeated_request_id_returns_cached_reply() {
        let state = test_state().await;
        let (c1, t1) = register(&state, 1).await;
        let req = ServiceRequest {
            request_id: 2,
            client_id: Some(c1),
            token: Some(t1),
            op: ServiceOp::CreateGroup { name: "g".into() },
        };
        let first = state.handle_request(req.clone()).await;
        let second = state.handle_request(req).await;
        assert!(matches!(first.result, ServiceResult::GroupCreated));
        assert!(matches!(second.result, ServiceResult::GroupCreated)); // cached, not NAME_TAKEN
    }

    #[tokio::test]
    async fn full_vote_flow_closes_on_all_ballots_with_tie_break() {
        let state = test_state().await;
        let (c1, t1) = register(&state, 1).await;
        let (c2, t2) = register(&state, 2).await;

        state
            .handle_request(ServiceRequest { request_id: 3, client_id: Some(c1), token: Some(t1), op: ServiceOp::CreateGroup { name: "g".into() } })
            .await;
        state
            .handle_request(ServiceRequest { request_id: 4, client_id: Some(c2), token: Some(t2), op: ServiceOp::JoinGroup { name: "g".into() } })
            .await;

        let reply = state
            .handle_request(ServiceRequest {
                request_id: 5,
                client_id: Some(c1),
                token: Some(t1),
                op: ServiceOp::StartVote {
                    group: "g".into(),
                    topic: "q?".into(),
                    options: vec!["a".into(), "b".into()],
                    timeout_ms: 60_000,
                },
            })
            .await;
        let ServiceResult::VoteStarted { vote_id } = reply.result else {
            panic!("expected VoteStarted");
        };

        state
            .handle_request(ServiceRequest { request_id: 6, client_id: Some(c1), token: Some(t1), op: ServiceOp::CastBallot { vote_id, option_index: 0 } })
            .await;
        state
            .handle_request(ServiceRequest { request_id: 7, client_id: Some(c2), token: Some(t2), op: ServiceOp::CastBallot { vote_id, option_index: 1 } })
            .await;

        let inner = state.inner.lock().await;
        let v = inner.votes.get(&vote_id).unwrap();
        assert_eq!(v.state, VoteState::Closed);
        assert_eq!(v.tally.as_ref().unwrap().counts, vec![1, 1]);
        assert_eq!(v.tally.as_ref().unwrap().winner, "a"); // tie broken by lowest index
    }

    #[tokio::test]
    async fn duplicate_ballot_from_same_client_is_ignored() {
        let state = test_state().await;
        let (c1, t1) = register(&state, 1).await;
        state
            .handle_request(ServiceRequest { request_id: 2, client_id: Some(c1), token: Some(t1), op: ServiceOp::CreateGroup { name: "g".into() } })
            .await;
        let reply = state
            .handle_request(ServiceRequest {
                request_id: 3,
                client_id: Some(c1),
                token: Some(t1),
                op: ServiceOp::StartVote { group: "g".into(), topic: "q?".into(), options: vec!["a".into()], timeout_ms: 60_000 },
            })
            .await;
        let ServiceResult::VoteStarted { vote_id } = reply.result else { panic!() };

        state
            .handle_request(ServiceRequest { request_id: 4, client_id: Some(c1), token: Some(t1), op: ServiceOp::CastBallot { vote_id, option_index: 0 } })
            .await;
        let second = state
            .handle_request(ServiceRequest { request_id: 5, client_id: Some(c1), token: Some(t1), op: ServiceOp::CastBallot { vote_id, option_index: 0 } })
            .await;
        assert!(matches!(second.result, ServiceResult::Duplicate));
    }
}
