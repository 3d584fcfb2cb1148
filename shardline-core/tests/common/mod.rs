//! Shared fixtures for the integration tests

#![allow(dead_code)]

use shardline_core::mailbox::Mailbox;
use shardline_core::protocol::{
    ListenerCard, PROTOCOL_VERSION, RegistrarMessage, RegistrationReply, ReplierCard,
    ReplierRequest, StreamWrite,
};
use shardline_core::testing::kv::{KvProtocol, KvReadResponse, MemoryStore};
use shardline_core::{
    AckPolicy, Broadcaster, BroadcasterCard, DirectoryEntry, Error, InMemoryBranchHistory,
    Listener, MailboxCluster, MailboxManager, Master, MasterAccess, MasterCard, Region,
    ReplicationConfig, Version,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Route test logs through the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> ReplicationConfig {
    ReplicationConfig::default()
        .with_ack_timeout(Duration::from_millis(500))
        .with_registration_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(2))
}

/// One region: a broadcaster plus everything needed to attach more components
pub struct TestRegion {
    pub cluster: MailboxCluster,
    pub history: Arc<InMemoryBranchHistory>,
    pub config: ReplicationConfig,
    pub region: Region,
    pub store: Arc<MemoryStore>,
    pub broadcaster: Arc<Broadcaster<KvProtocol>>,
    pub broadcaster_entry: DirectoryEntry<BroadcasterCard<KvProtocol>>,
}

impl TestRegion {
    pub fn start(config: ReplicationConfig) -> Self {
        init_tracing();
        let cluster = MailboxCluster::new();
        let history = Arc::new(InMemoryBranchHistory::new());
        let region = Region::universe();
        let store = Arc::new(MemoryStore::new(region.clone()));
        let broadcaster = Arc::new(
            Broadcaster::<KvProtocol>::new(cluster.join(), history.clone(), store.clone(), config.clone())
                .unwrap(),
        );
        let broadcaster_entry = DirectoryEntry::new(broadcaster.get_business_card());
        Self {
            cluster,
            history,
            config,
            region,
            store,
            broadcaster,
            broadcaster_entry,
        }
    }

    /// Join a listener backed by `store`
    pub async fn join_with(
        &self,
        store: Arc<MemoryStore>,
    ) -> shardline_core::Result<Arc<Listener<KvProtocol>>> {
        let listener = Listener::join(
            self.cluster.join(),
            self.broadcaster_entry.view(),
            self.history.clone(),
            store,
            &self.config,
            &CancellationToken::new(),
        )
        .await?;
        Ok(Arc::new(listener))
    }

    /// Join a listener backed by a fresh empty store
    pub async fn add_listener(&self) -> (Arc<Listener<KvProtocol>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(self.region.clone()));
        let listener = self.join_with(store.clone()).await.unwrap();
        (listener, store)
    }

    /// Start a master over the current broadcaster and publish it
    pub fn add_master(
        &self,
        policy: AckPolicy,
    ) -> (Master<KvProtocol>, DirectoryEntry<MasterCard<KvProtocol>>) {
        let master = Master::new(
            self.cluster.join(),
            policy,
            self.region.clone(),
            self.broadcaster.clone(),
            self.config.clone(),
        )
        .unwrap();
        let entry = DirectoryEntry::new(master.get_business_card());
        (master, entry)
    }

    /// Open a client session against whatever `entry` publishes
    pub fn client(&self, entry: &DirectoryEntry<MasterCard<KvProtocol>>) -> MasterAccess<KvProtocol> {
        MasterAccess::new(self.cluster.join(), entry.view(), self.config.clone())
    }

    /// Register a listener that receives the stream but never acks.
    ///
    /// The returned mailbox must stay alive for the listener to stay joined.
    pub async fn join_silent_listener(&self) -> (MailboxManager, Mailbox<StreamWrite<KvProtocol>>) {
        let peer = self.cluster.join();
        let stream = peer.create::<StreamWrite<KvProtocol>>();
        let mut reply = peer.create::<RegistrationReply>();
        let register = RegistrarMessage::Register {
            listener: ListenerCard {
                peer: peer.peer_id(),
                stream: stream.address(),
            },
            version: Version::zero(),
            region: self.region.clone(),
            protocol_version: PROTOCOL_VERSION,
            reply: reply.address(),
        };
        peer.send(&self.broadcaster.get_business_card().registrar, &register)
            .unwrap();
        let reply = reply.recv().await.unwrap();
        assert!(matches!(reply, RegistrationReply::Accepted { .. }));
        (peer, stream)
    }

    /// Advertise `peer` as a readable replier that refuses every read after `delay`
    pub fn add_refusing_replier(&self, peer: &MailboxManager, delay: Duration) {
        let mut reads = peer.create::<ReplierRequest<KvProtocol>>();
        let upgrade = RegistrarMessage::UpgradeReadable {
            peer: peer.peer_id(),
            replier: ReplierCard {
                peer: peer.peer_id(),
                reads: reads.address(),
            },
        };
        peer.send(&self.broadcaster.get_business_card().registrar, &upgrade)
            .unwrap();

        let responder = peer.clone();
        tokio::spawn(async move {
            while let Some(request) = reads.recv().await {
                tokio::time::sleep(delay).await;
                let refusal: shardline_core::Result<KvReadResponse> =
                    Err(Error::cannot_perform_query("replica is behind"));
                let _ = responder.send(&request.reply, &refusal);
            }
        });
    }
}
