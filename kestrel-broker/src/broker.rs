//! Per-broker request handling: produce, fetch and offset lookup.
//!
//! A [`Broker`] serves a request only for partitions it currently leads.
//! Anything else fails with `NotLeaderForPartition`, carrying the current
//! leader so the client can retry there.

#![allow(clippy::significant_drop_tightening)]

use std::sync::Arc;

use kestrel_core::{NodeId, Offset, PartitionId, Record, Timestamp, TopicPartition};
use kestrel_partition::{AckMode, FetchResult, ReplicationGroup};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::error::{BrokerError, BrokerResult};
use crate::topic::PartitionHandle;

/// Result of a successful produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    /// Partition the records went to.
    pub topic_partition: TopicPartition,
    /// Offset of the first record.
    pub base_offset: Offset,
    /// Offset after the last record.
    pub next_offset: Offset,
    /// High-water mark when the produce was acknowledged.
    pub high_water_mark: Offset,
}

/// Which offset a lookup returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// First retained offset.
    Earliest,
    /// High-water mark: the offset of the next committed record.
    Latest,
}

/// Request handle for one broker of a cluster.
#[derive(Debug, Clone)]
pub struct Broker {
    id: NodeId,
    cluster: Arc<Cluster>,
}

impl Broker {
    pub(crate) const fn new(id: NodeId, cluster: Arc<Cluster>) -> Self {
        Self { id, cluster }
    }

    /// Returns this broker's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Produces one record.
    ///
    /// Without an explicit partition, keyed records go to
    /// `crc32(key) % partitions` and unkeyed records round-robin.
    ///
    /// # Errors
    /// See [`Broker::produce_batch`].
    pub async fn produce(
        &self,
        topic: &str,
        partition: Option<PartitionId>,
        record: Record,
        acks: AckMode,
    ) -> BrokerResult<ProduceResponse> {
        self.produce_batch(topic, partition, vec![record], acks).await
    }

    /// Produces records to one partition.
    ///
    /// Without an explicit partition, the first record's key picks it. With
    /// `AckMode::All` the call returns once the records are below the
    /// high-water mark; with `AckMode::Leader` it returns after the leader
    /// append. The partition lock is released right after the append, and
    /// followers copy the records in background replication rounds.
    ///
    /// # Errors
    /// Returns `InvalidRequest` or `InvalidRecord` for bad input,
    /// `BrokerOffline`, `UnknownTopic`, `UnknownPartition`,
    /// `NotLeaderForPartition`, `Replication(NotEnoughReplicas)` when the
    /// online ISR is below `min_in_sync_replicas`, and `RequestTimedOut` if
    /// the high-water mark does not cover the records within the ack timeout.
    pub async fn produce_batch(
        &self,
        topic: &str,
        partition: Option<PartitionId>,
        records: Vec<Record>,
        acks: AckMode,
    ) -> BrokerResult<ProduceResponse> {
        self.ensure_online().await?;
        self.validate_records(&records)?;

        let topic = self.cluster.topic(topic).await?;
        let partition =
            partition.unwrap_or_else(|| topic.select_partition(records[0].key.as_deref()));
        let handle = topic.partition(partition)?;

        let (outcome, epoch) = {
            let mut group = handle.write().await?;
            self.check_leader(&group)?;
            let outcome = group.append(records, acks, Timestamp::now())?;
            (outcome, group.leader_epoch())
        };

        let high_water_mark = match acks {
            AckMode::Leader => outcome.high_water_mark,
            AckMode::All if outcome.high_water_mark >= outcome.next_offset => outcome.high_water_mark,
            AckMode::All => self.await_high_water_mark(&handle, outcome.next_offset, epoch).await?,
        };

        debug!(
            broker = %self.id,
            topic_partition = %handle.topic_partition(),
            base_offset = outcome.base_offset.get(),
            next_offset = outcome.next_offset.get(),
            ?acks,
            "Produced records"
        );
        Ok(ProduceResponse {
            topic_partition: handle.topic_partition().clone(),
            base_offset: outcome.base_offset,
            next_offset: outcome.next_offset,
            high_water_mark,
        })
    }

    /// Fetches committed records starting at `start`.
    ///
    /// # Errors
    /// Returns `BrokerOffline`, `UnknownTopic`, `UnknownPartition`,
    /// `NotLeaderForPartition`, and `Partition(OutOfRange)` if `start` is
    /// outside the retained log.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        start: Offset,
        max_bytes: u64,
    ) -> BrokerResult<FetchResult> {
        self.ensure_online().await?;
        let handle = self.cluster.topic(topic).await?.partition(partition)?;
        let max_bytes = max_bytes.min(u64::from(self.cluster.config().limits.max_fetch_bytes));

        let group = handle.read().await?;
        self.check_leader(&group)?;
        let result = group.fetch(start, max_bytes)?;
        debug!(
            broker = %self.id,
            topic_partition = %handle.topic_partition(),
            start = start.get(),
            records = result.records.len(),
            next_offset = result.next_offset.get(),
            "Served fetch"
        );
        Ok(result)
    }

    /// Looks up the earliest retained offset or the high-water mark.
    ///
    /// # Errors
    /// Returns `BrokerOffline`, `UnknownTopic`, `UnknownPartition` or
    /// `NotLeaderForPartition`.
    pub async fn list_offset(
        &self,
        topic: &str,
        partition: PartitionId,
        spec: OffsetSpec,
    ) -> BrokerResult<Offset> {
        self.ensure_online().await?;
        let handle = self.cluster.topic(topic).await?.partition(partition)?;
        let group = handle.read().await?;
        self.check_leader(&group)?;
        Ok(match spec {
            OffsetSpec::Earliest => group.log_start_offset(),
            OffsetSpec::Latest => group.high_water_mark(),
        })
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    async fn ensure_online(&self) -> BrokerResult<()> {
        if self.cluster.is_broker_online(self.id).await? {
            Ok(())
        } else {
            Err(BrokerError::BrokerOffline { broker: self.id })
        }
    }

    fn validate_records(&self, records: &[Record]) -> BrokerResult<()> {
        let limits = &self.cluster.config().limits;
        if records.is_empty() {
            return Err(BrokerError::InvalidRequest {
                reason: "produce request has no records".to_string(),
            });
        }
        if records.len() > limits.max_records_per_produce as usize {
            return Err(BrokerError::InvalidRequest {
                reason: format!(
                    "{} records exceeds limit of {}",
                    records.len(),
                    limits.max_records_per_produce
                ),
            });
        }
        for record in records {
            record.validate(limits)?;
        }
        Ok(())
    }

    fn check_leader(&self, group: &ReplicationGroup) -> BrokerResult<()> {
        let leader = group.leader();
        if leader == Some(self.id) {
            return Ok(());
        }
        Err(BrokerError::NotLeaderForPartition {
            topic_partition: group.topic_partition().clone(),
            leader_hint: leader,
        })
    }

    /// Waits until the high-water mark reaches `target`.
    ///
    /// Each pass asks the replication task for a round and sleeps until the
    /// partition reports progress. Fails if leadership moves away: the
    /// records may have been truncated by the new leader.
    async fn await_high_water_mark(
        &self,
        handle: &PartitionHandle,
        target: Offset,
        epoch: u64,
    ) -> BrokerResult<Offset> {
        let config = self.cluster.config();
        let deadline = Instant::now() + config.ack_timeout();
        loop {
            let progressed = handle.progressed();
            tokio::pin!(progressed);
            progressed.as_mut().enable();
            {
                let group = handle.read().await?;
                if group.leader_epoch() != epoch {
                    return Err(BrokerError::NotLeaderForPartition {
                        topic_partition: handle.topic_partition().clone(),
                        leader_hint: group.leader(),
                    });
                }
                let high_water_mark = group.high_water_mark();
                if high_water_mark >= target {
                    return Ok(high_water_mark);
                }
            }

            self.cluster.request_replication();
            if tokio::time::timeout_at(deadline, progressed).await.is_err() {
                warn!(
                    broker = %self.id,
                    topic_partition = %handle.topic_partition(),
                    target = target.get(),
                    timeout_ms = config.ack_timeout_ms,
                    "Produce not acknowledged in time"
                );
                return Err(BrokerError::RequestTimedOut {
                    topic_partition: handle.topic_partition().clone(),
                    timeout_ms: config.ack_timeout_ms,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use kestrel_partition::RetentionPolicy;
    use std::time::Duration;

    async fn setup() -> Arc<Cluster> {
        let cluster = Cluster::open(ClusterConfig::with_broker_count(3)).await.unwrap();
        cluster
            .create_topic("orders", 3, 3, RetentionPolicy::default())
            .await
            .unwrap();
        cluster
    }

    async fn setup_running() -> Arc<Cluster> {
        let cluster = Cluster::start(ClusterConfig::with_broker_count(3)).await.unwrap();
        cluster
            .create_topic("orders", 3, 3, RetentionPolicy::default())
            .await
            .unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_produce_to_follower_redirects() {
        let cluster = setup().await;
        let follower = cluster.broker(NodeId::new(2)).await.unwrap();
        let err = follower
            .produce("orders", Some(PartitionId::new(0)), Record::new("x"), AckMode::All)
            .await
            .unwrap_err();
        match err {
            BrokerError::NotLeaderForPartition { leader_hint, .. } => {
                assert_eq!(leader_hint, Some(NodeId::new(1)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_produce_ack_all_covers_records() {
        let cluster = setup_running().await;
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        let response = leader
            .produce_batch(
                "orders",
                Some(PartitionId::new(0)),
                vec![Record::new("a"), Record::new("b")],
                AckMode::All,
            )
            .await
            .unwrap();
        assert_eq!(response.base_offset, Offset::ZERO);
        assert_eq!(response.next_offset, Offset::new(2));
        assert_eq!(response.high_water_mark, Offset::new(2));
    }

    #[tokio::test]
    async fn test_produce_ack_leader_does_not_wait() {
        let cluster = setup().await;
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        let response = leader
            .produce("orders", Some(PartitionId::new(0)), Record::new("a"), AckMode::Leader)
            .await
            .unwrap();
        assert_eq!(response.next_offset, Offset::new(1));
        assert_eq!(response.high_water_mark, Offset::ZERO);

        // Uncommitted records are invisible until a replication round.
        let fetched = leader.fetch("orders", PartitionId::new(0), Offset::ZERO, 1024).await.unwrap();
        assert!(fetched.records.is_empty());
        cluster.run_replication_round(Timestamp::now()).await;
        let fetched = leader.fetch("orders", PartitionId::new(0), Offset::ZERO, 1024).await.unwrap();
        assert_eq!(fetched.records.len(), 1);
    }

    #[tokio::test]
    async fn test_produce_rejects_bad_requests() {
        let cluster = setup().await;
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        let err = leader
            .produce_batch("orders", Some(PartitionId::new(0)), Vec::new(), AckMode::All)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest { .. }));

        let huge = Record::new(vec![0u8; 2 * 1024 * 1024]);
        let err = leader
            .produce("orders", Some(PartitionId::new(0)), huge, AckMode::All)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRecord(_)));

        let tagged = Record::new("x").with_header("blob", vec![0u8; 128 * 1024]);
        let err = leader
            .produce("orders", Some(PartitionId::new(0)), tagged, AckMode::All)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRecord(_)));

        let err = leader
            .produce("orders", Some(PartitionId::new(7)), Record::new("x"), AckMode::All)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownPartition { .. }));

        let err = leader
            .produce("ghost", None, Record::new("x"), AckMode::All)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic { .. }));
    }

    #[tokio::test]
    async fn test_offline_broker_refuses_requests() {
        let cluster = setup().await;
        cluster.set_broker_online(NodeId::new(3), false).await.unwrap();
        let broker = cluster.broker(NodeId::new(3)).await.unwrap();
        let err = broker
            .fetch("orders", PartitionId::new(2), Offset::ZERO, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BrokerOffline { .. }));
    }

    #[tokio::test]
    async fn test_list_offsets() {
        let cluster = setup_running().await;
        let leader = cluster.broker(NodeId::new(2)).await.unwrap();
        for i in 0..5 {
            leader
                .produce("orders", Some(PartitionId::new(1)), Record::new(format!("v{i}")), AckMode::All)
                .await
                .unwrap();
        }
        let earliest = leader.list_offset("orders", PartitionId::new(1), OffsetSpec::Earliest).await.unwrap();
        let latest = leader.list_offset("orders", PartitionId::new(1), OffsetSpec::Latest).await.unwrap();
        assert_eq!(earliest, Offset::ZERO);
        assert_eq!(latest, Offset::new(5));
    }

    #[tokio::test]
    async fn test_ack_all_waits_for_replication_rounds() {
        let cluster = setup().await;
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        let pending = tokio::spawn({
            let leader = leader.clone();
            async move {
                leader
                    .produce("orders", Some(PartitionId::new(0)), Record::new("a"), AckMode::All)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // Reads are served while the produce waits, and nothing was copied.
        let fetched = leader.fetch("orders", PartitionId::new(0), Offset::ZERO, 1024).await.unwrap();
        assert!(fetched.records.is_empty());
        let handle = cluster.topic("orders").await.unwrap().partition(PartitionId::new(0)).unwrap();
        {
            let group = handle.read().await.unwrap();
            assert_eq!(group.log_end_offset(), Offset::new(1));
            assert_eq!(group.replica_log(NodeId::new(2)).unwrap().log_end_offset(), Offset::ZERO);
        }

        cluster.run_replication_round(Timestamp::now()).await;
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.next_offset, Offset::new(1));
        assert_eq!(response.high_water_mark, Offset::new(1));
    }

    #[tokio::test]
    async fn test_ack_all_fails_when_leadership_moves() {
        let cluster = setup().await;
        let leader = cluster.broker(NodeId::new(1)).await.unwrap();
        let pending = tokio::spawn({
            let leader = leader.clone();
            async move {
                leader
                    .produce("orders", Some(PartitionId::new(0)), Record::new("a"), AckMode::All)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cluster.set_broker_online(NodeId::new(1), false).await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::NotLeaderForPartition { .. }));
    }
}
