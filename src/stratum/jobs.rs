//! Per-connection job construction and delivery

use super::context::ConnectionContext;
use super::event::StratumMethod;
use crate::error::{Error, Result};
use crate::node::{BlockHeader, BlockTemplate};
use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use byteorder::{LittleEndian, WriteBytesExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::debug;

/// Jobs kept per connection for share lookup
pub const MAX_JOBS: usize = 300;

/// Miners that expect the header and timestamp packed in one hex string
static BIG_JOB_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(".*(BzMiner|IceRiverMiner).*").expect("valid big job pattern"));

/// Source of block templates personalized per miner
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Fetch a template paying `wallet_addr`, tagged with `remote_app`
    async fn get_block_template(&self, wallet_addr: &str, remote_app: &str)
        -> Result<BlockTemplate>;
}

/// A job sent to the miner
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub template: BlockTemplate,
    pub pre_pow_hash: [u8; 32],
}

/// Bounded job history of one connection
#[derive(Debug, Default)]
pub struct MiningState {
    jobs: VecDeque<Job>,
    next_id: u64,
    difficulty_sent: bool,
}

impl MiningState {
    /// Store a job, evicting the oldest beyond [`MAX_JOBS`], and return its id
    pub fn add_job(&mut self, template: BlockTemplate, pre_pow_hash: [u8; 32]) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if self.jobs.len() == MAX_JOBS {
            self.jobs.pop_front();
        }
        self.jobs.push_back(Job {
            id,
            template,
            pre_pow_hash,
        });
        id
    }

    /// Look up a job by id
    pub fn get_job(&self, id: u64) -> Option<&Job> {
        self.jobs.iter().rev().find(|job| job.id == id)
    }

    /// Number of jobs held
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

fn decode_hash(hash: &str, field: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hash)
        .map_err(|e| Error::invalid_template(format!("{} is not hex: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::invalid_template(format!("{} must be 32 bytes", field)))
}

fn decode_blue_work(blue_work: &str) -> Result<Vec<u8>> {
    let padded = if blue_work.len() % 2 == 1 {
        format!("0{}", blue_work)
    } else {
        blue_work.to_string()
    };
    let bytes = hex::decode(padded)
        .map_err(|e| Error::invalid_template(format!("blueWork is not hex: {}", e)))?;
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    Ok(bytes[start..].to_vec())
}

/// Header hash with timestamp and nonce zeroed, the miner's work input
pub fn pre_pow_hash(header: &BlockHeader) -> Result<[u8; 32]> {
    let mut buf = Vec::with_capacity(512);
    buf.write_u16::<LittleEndian>(header.version)?;
    buf.write_u64::<LittleEndian>(header.parents.len() as u64)?;
    for level in &header.parents {
        buf.write_u64::<LittleEndian>(level.parent_hashes.len() as u64)?;
        for parent in &level.parent_hashes {
            buf.extend_from_slice(&decode_hash(parent, "parent hash")?);
        }
    }
    buf.extend_from_slice(&decode_hash(&header.hash_merkle_root, "hashMerkleRoot")?);
    buf.extend_from_slice(&decode_hash(
        &header.accepted_id_merkle_root,
        "acceptedIdMerkleRoot",
    )?);
    buf.extend_from_slice(&decode_hash(&header.utxo_commitment, "utxoCommitment")?);
    buf.write_u64::<LittleEndian>(0)?; // timestamp
    buf.write_u32::<LittleEndian>(header.bits)?;
    buf.write_u64::<LittleEndian>(0)?; // nonce
    buf.write_u64::<LittleEndian>(header.daa_score)?;
    buf.write_u64::<LittleEndian>(header.blue_score)?;
    let blue_work = decode_blue_work(&header.blue_work)?;
    buf.write_u64::<LittleEndian>(blue_work.len() as u64)?;
    buf.extend_from_slice(&blue_work);
    buf.extend_from_slice(&decode_hash(&header.pruning_point, "pruningPoint")?);

    let mut hasher = Blake2bMac::<U32>::new_from_slice(b"BlockHash")
        .map_err(|e| Error::invalid_template(format!("hasher key rejected: {}", e)))?;
    hasher.update(&buf);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize().into_bytes());
    Ok(out)
}

/// Whether `remote_app` wants the packed single-string job format
pub fn uses_big_job(remote_app: &str) -> bool {
    BIG_JOB_REGEX.is_match(remote_app)
}

/// Build `mining.notify` params for a job
pub fn notify_params(job_id: u64, pre_pow_hash: &[u8; 32], timestamp: i64, big_job: bool) -> Vec<Value> {
    let id = Value::String(job_id.to_string());
    if big_job {
        let mut packed = pre_pow_hash.to_vec();
        packed.extend_from_slice(&(timestamp as u64).to_le_bytes());
        return vec![id, Value::String(hex::encode(packed))];
    }

    let words: Vec<u64> = pre_pow_hash
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect();
    vec![id, json!(words), json!(timestamp)]
}

/// Fetch a fresh template for an authorized connection and send it as a job
///
/// Unauthorized connections are skipped. The share difficulty is announced
/// once, before the first job.
pub async fn send_job(
    ctx: &mut ConnectionContext,
    source: &dyn TemplateSource,
    min_share_diff: f64,
) -> Result<()> {
    if !ctx.is_authorized() {
        return Ok(());
    }

    let template = source
        .get_block_template(ctx.wallet_addr(), ctx.remote_app())
        .await?;
    let hash = pre_pow_hash(&template.block.header)?;
    let timestamp = template.block.header.timestamp;
    let job_id = ctx.mining.add_job(template, hash);

    if !ctx.mining.difficulty_sent {
        ctx.push(StratumMethod::SetDifficulty.as_str(), vec![json!(min_share_diff)])
            .await?;
        ctx.mining.difficulty_sent = true;
    }

    let params = notify_params(job_id, &hash, timestamp, uses_big_job(ctx.remote_app()));
    ctx.push(StratumMethod::Notify.as_str(), params).await?;
    debug!("sent job {}", job_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Block, BlockLevelParents};
    use crate::stratum::address::Network;
    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            parents: vec![BlockLevelParents {
                parent_hashes: vec!["11".repeat(32), "22".repeat(32)],
            }],
            hash_merkle_root: "33".repeat(32),
            accepted_id_merkle_root: "44".repeat(32),
            utxo_commitment: "55".repeat(32),
            timestamp: 1_700_000_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
            daa_score: 1000,
            blue_work: "0a1b2c".to_string(),
            blue_score: 900,
            pruning_point: "66".repeat(32),
        }
    }

    struct FixedSource {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TemplateSource for FixedSource {
        async fn get_block_template(&self, wallet_addr: &str, remote_app: &str) -> Result<BlockTemplate> {
            self.calls.lock().push((wallet_addr.to_string(), remote_app.to_string()));
            Ok(BlockTemplate {
                block: Block {
                    header: header(),
                    transactions: vec![],
                },
                is_synced: true,
            })
        }
    }

    #[test]
    fn test_pre_pow_hash_ignores_timestamp_and_nonce() {
        let base = pre_pow_hash(&header()).unwrap();
        let mut other = header();
        other.timestamp += 1;
        other.nonce = 7;
        assert_eq!(pre_pow_hash(&other).unwrap(), base);

        other.daa_score += 1;
        assert_ne!(pre_pow_hash(&other).unwrap(), base);
    }

    #[test]
    fn test_blue_work_leading_zeros_are_trimmed() {
        let mut padded = header();
        padded.blue_work = "000a1b2c".to_string();
        assert_eq!(pre_pow_hash(&padded).unwrap(), pre_pow_hash(&header()).unwrap());
        assert_eq!(decode_blue_work("abc").unwrap(), vec![0x0a, 0xbc]);
    }

    #[test]
    fn test_invalid_hash_rejected() {
        let mut bad = header();
        bad.pruning_point = "zz".to_string();
        assert!(matches!(pre_pow_hash(&bad), Err(Error::InvalidTemplate { .. })));
        bad.pruning_point = "00".to_string();
        assert!(matches!(pre_pow_hash(&bad), Err(Error::InvalidTemplate { .. })));
    }

    #[test]
    fn test_notify_params_formats() {
        let mut hash = [0u8; 32];
        hash[0] = 1;
        hash[8] = 2;
        let params = notify_params(5, &hash, 1000, false);
        assert_eq!(params, vec![json!("5"), json!([1u64, 2u64, 0u64, 0u64]), json!(1000)]);

        let params = notify_params(6, &hash, 1, true);
        assert_eq!(params.len(), 2);
        let packed = params[1].as_str().unwrap();
        assert_eq!(packed.len(), 80);
        assert!(packed.ends_with("0100000000000000"));
    }

    #[test]
    fn test_big_job_detection() {
        assert!(uses_big_job("BzMiner-v19.1.0"));
        assert!(uses_big_job("IceRiverMiner-v1.1"));
        assert!(!uses_big_job("lolMiner 1.88"));
    }

    #[test]
    fn test_job_history_is_bounded() {
        let mut state = MiningState::default();
        for _ in 0..MAX_JOBS + 5 {
            state.add_job(BlockTemplate::default(), [0u8; 32]);
        }
        assert_eq!(state.job_count(), MAX_JOBS);
        assert!(state.get_job(1).is_none());
        assert!(state.get_job((MAX_JOBS + 5) as u64).is_some());
    }

    #[tokio::test]
    async fn test_send_job_announces_difficulty_once() {
        let (client, server) = tokio::io::duplex(8192);
        let mut ctx = ConnectionContext::new("10.0.0.3:1", Box::new(server));
        let source = FixedSource {
            calls: Mutex::new(vec![]),
        };

        send_job(&mut ctx, &source, 4.0).await.unwrap();
        assert!(source.calls.lock().is_empty());

        ctx.mark_subscribed(Some("lolMiner 1.88"));
        ctx.mark_authorized("karlsen:test".to_string(), "rig".to_string(), Network::Mainnet);
        send_job(&mut ctx, &source, 4.0).await.unwrap();
        send_job(&mut ctx, &source, 4.0).await.unwrap();

        let mut lines = BufReader::new(client).lines();
        let methods: Vec<Value> = {
            let mut out = vec![];
            for _ in 0..3 {
                let line = lines.next_line().await.unwrap().unwrap();
                out.push(serde_json::from_str::<Value>(&line).unwrap());
            }
            out
        };
        assert_eq!(methods[0]["method"], "mining.set_difficulty");
        assert_eq!(methods[0]["params"], json!([4.0]));
        assert_eq!(methods[1]["method"], "mining.notify");
        assert_eq!(methods[1]["params"][0], "1");
        assert_eq!(methods[2]["params"][0], "2");
        assert_eq!(
            source.calls.lock()[0],
            ("karlsen:test".to_string(), "lolMiner 1.88".to_string())
        );
        assert_eq!(ctx.mining.job_count(), 2);
    }
}
