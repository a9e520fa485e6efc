//! One scan from card to prover inputs.


use std::sync::{Arc, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use num_bigint::BigUint;
use tracing::{info, instrument, warn};

use crate::chip_auth::{self, ChipAuthOutcome};
use crate::encoder::{CanonicalEncoder, CanonicalPassportRecord, EncoderConfig, MerkleProof};
use crate::error::ScanError;
use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::file::DEFAULT_CHUNK_SIZE;
use crate::lds::dg2::FaceImage;
use crate::mrz::{DocumentCredentials, MrzAttribute};
use crate::passive_auth::PassiveAuthenticator;
use crate::reader::DocumentReader;
use crate::session::{ChannelProtocol, ChipSession, PacePolicy};
use crate::trust_store::TrustedCertificateSet;


/// Upper bound on a single APDU exchange unless configured otherwise.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanConfig {
    pub exchange_timeout: Duration,
    pub pace_policy: PacePolicy,

    /// Bytes requested per READ BINARY.
    pub chunk_size: u8,

    pub encoder: EncoderConfig,
    pub revealed_attributes: Vec<MrzAttribute>,
    pub merkle_proof: Option<MerkleProof>,
}
impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            pace_policy: PacePolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            encoder: EncoderConfig::default(),
            revealed_attributes: Vec::new(),
            merkle_proof: None,
        }
    }
}


/// What a successful scan produces.
#[derive(Clone, Debug)]
pub struct ScanOutcome {
    pub record: CanonicalPassportRecord,
    pub face: FaceImage,
    pub channel_protocol: ChannelProtocol,
    pub chip_auth: ChipAuthOutcome,
}


/// Fails exchanges that take longer than the timeout.
///
/// The transport is blocking, so an overlong exchange is detected once it returns; its response
/// is discarded.
#[derive(Debug)]
pub struct DeadlineCard<SC: SmartCard> {
    card: SC,
    timeout: Duration,
}
impl<SC: SmartCard> DeadlineCard<SC> {
    pub fn new(card: SC, timeout: Duration) -> Self {
        Self { card, timeout }
    }

    pub fn into_inner(self) -> SC { self.card }
}
impl<SC: SmartCard> SmartCard for DeadlineCard<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let started = Instant::now();
        let response = self.card.communicate(request)?;
        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            warn!("exchange took {} ms, limit is {} ms", elapsed.as_millis(), self.timeout.as_millis());
            return Err(CommunicationError::Timeout { elapsed });
        }
        Ok(response)
    }
}


/// Runs a complete scan: secure channel, Chip Authentication if DG14 allows it, reading, Passive
/// Authentication and encoding.
///
/// The card session ends before the data is verified.
#[instrument(skip_all)]
pub fn negotiate_and_read<SC: SmartCard>(
    card: SC,
    credentials: &DocumentCredentials,
    address: &BigUint,
    config: &ScanConfig,
    trust_store: Arc<TrustedCertificateSet>,
) -> Result<ScanOutcome, ScanError> {
    let mut session = ChipSession::new(DeadlineCard::new(card, config.exchange_timeout));
    let channel_protocol = session.negotiate(credentials, config.pace_policy, config.chunk_size)?;

    let reader = DocumentReader::new(config.chunk_size);
    let dg14 = reader.read_dg14(&mut session)?;
    let chip_auth = match &dg14 {
        Some(dg14) => chip_auth::authenticate(&mut session, dg14),
        None => ChipAuthOutcome { succeeded: false, protocol: None },
    };
    let document = reader.read_document(&mut session, dg14)?;
    drop(session);

    let auth = PassiveAuthenticator::new(trust_store)
        .verify(&document, chip_auth.succeeded)?;
    let record = CanonicalEncoder::new(config.encoder).encode(
        document.dg1.mrz(),
        &auth,
        address,
        &config.revealed_attributes,
        config.merkle_proof.as_ref(),
    )?;

    let face = document.dg2.face().clone();
    info!(
        "scan complete: {:?}, chip authentication {}, face image {}x{}",
        channel_protocol,
        if chip_auth.succeeded { "succeeded" } else { "not performed or failed" },
        face.width, face.height,
    );
    Ok(ScanOutcome { record, face, channel_protocol, chip_auth })
}


/// Marks a scanner as busy until dropped.
struct ActiveScan<'s> {
    flag: &'s AtomicBool,
}
impl<'s> ActiveScan<'s> {
    fn acquire(flag: &'s AtomicBool) -> Result<Self, ScanError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ScanError::ScanInProgress)?;
        Ok(Self { flag })
    }
}
impl<'s> Drop for ActiveScan<'s> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}


/// Runs scans one at a time against a replaceable trust store.
#[derive(Debug)]
pub struct Scanner {
    config: ScanConfig,
    trust_store: RwLock<Arc<TrustedCertificateSet>>,
    active: AtomicBool,
}
impl Scanner {
    /// Creates a scanner that trusts nobody until [`load_trust_store`](Self::load_trust_store) is
    /// called.
    pub fn new(config: ScanConfig) -> Self {
        Self::with_trust_store(config, Arc::new(TrustedCertificateSet::default()))
    }

    pub fn with_trust_store(config: ScanConfig, trust_store: Arc<TrustedCertificateSet>) -> Self {
        Self {
            config,
            trust_store: RwLock::new(trust_store),
            active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ScanConfig { &self.config }

    pub fn trust_store(&self) -> Arc<TrustedCertificateSet> {
        let guard = self.trust_store.read()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Parses a master list and makes it the trust store of subsequent scans.
    ///
    /// On failure, the previous trust store stays in place.
    pub fn load_trust_store(&self, master_list: &[u8]) -> Result<Arc<TrustedCertificateSet>, ScanError> {
        let store = Arc::new(TrustedCertificateSet::from_master_list(master_list)?);
        info!("trust store holds {} CSCA certificates", store.len());
        let mut guard = self.trust_store.write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&store);
        Ok(store)
    }

    pub fn is_scanning(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Scans the document on `card`. Fails immediately with [`ScanError::ScanInProgress`] if
    /// another scan is running.
    pub fn negotiate_and_read<SC: SmartCard>(
        &self,
        card: SC,
        credentials: &DocumentCredentials,
        address: &BigUint,
    ) -> Result<ScanOutcome, ScanError> {
        let _active = ActiveScan::acquire(&self.active)?;
        negotiate_and_read(card, credentials, address, &self.config, self.trust_store())
    }
}
