use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mrtd_zk::encoder::{EncoderConfig, MerkleProof};
use mrtd_zk::mrz::{DocumentCredentials, MrzAttribute};
use mrtd_zk::scan::{ScanConfig, Scanner};
use mrtd_zk::session::PacePolicy;
use num_bigint::BigUint;
use serde::Deserialize;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;


#[derive(Clone, Debug, Eq, Parser, PartialEq)]
enum Mode {
    ListReaders,
    Scan(ScanOpts),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ValueEnum)]
enum PacePolicyArg {
    FallBackToBac,
    Fail,
}
impl From<PacePolicyArg> for PacePolicy {
    fn from(value: PacePolicyArg) -> Self {
        match value {
            PacePolicyArg::FallBackToBac => PacePolicy::FallBackToBac,
            PacePolicyArg::Fail => PacePolicy::Fail,
        }
    }
}

#[derive(Clone, Debug, Eq, Parser, PartialEq)]
struct ScanOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    #[arg(long)]
    pub document_number: String,

    /// YYMMDD
    #[arg(long)]
    pub date_of_birth: String,

    /// YYMMDD
    #[arg(long)]
    pub date_of_expiry: String,

    /// CSCA master list, either bare or wrapped in CMS.
    #[arg(short, long = "master-list")]
    pub master_list_path: PathBuf,

    /// Decimal, or hexadecimal with a 0x prefix.
    #[arg(long, default_value = "0", value_parser = parse_address)]
    pub address: BigUint,

    /// MRZ attribute to reveal; may be repeated.
    #[arg(long = "reveal", value_parser = parse_attribute)]
    pub revealed_attributes: Vec<MrzAttribute>,

    #[arg(long, value_enum, default_value = "fall-back-to-bac")]
    pub pace_policy: PacePolicyArg,

    #[arg(long, default_value = "10")]
    pub timeout_secs: u64,

    /// JSON file overriding the shape of the prover inputs.
    #[arg(long = "encoder-config")]
    pub encoder_config_path: Option<PathBuf>,

    /// JSON file with pathIndices, siblings and root.
    #[arg(long = "merkle-proof")]
    pub merkle_proof_path: Option<PathBuf>,

    /// Where to write the face image.
    #[arg(long = "face")]
    pub face_path: Option<PathBuf>,

    /// Where to write the prover inputs; standard output if not given.
    #[arg(short, long = "output")]
    pub output_path: Option<PathBuf>,
}


/// A Merkle proof as stored next to the registry, numbers as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MerkleProofFile {
    path_indices: Vec<u64>,
    siblings: Vec<String>,
    root: String,
}
impl MerkleProofFile {
    fn into_proof(self) -> Result<MerkleProof, String> {
        let parse = |s: &str| BigUint::parse_bytes(s.as_bytes(), 10)
            .ok_or_else(|| format!("invalid number {:?} in Merkle proof", s));
        let siblings = self.siblings.iter()
            .map(|s| parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        let root = parse(&self.root)?;
        Ok(MerkleProof { path_indices: self.path_indices, siblings, root })
    }
}


fn parse_address(s: &str) -> Result<BigUint, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16),
        None => BigUint::parse_bytes(s.as_bytes(), 10),
    };
    parsed.ok_or_else(|| format!("invalid address {:?}", s))
}

fn parse_attribute(s: &str) -> Result<MrzAttribute, String> {
    s.parse().map_err(|_| {
        let names: Vec<&str> = MrzAttribute::ALL.iter().map(|a| a.name()).collect();
        format!("unknown attribute {:?}; expected one of {}", s, names.join(", "))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Box<dyn Error>> {
    let file = File::open(path)
        .map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let value = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
    Ok(value)
}


fn list_readers(ctx: &pcsc::Context) -> Result<(), Box<dyn Error>> {
    let readers_buf_len = ctx.list_readers_len()?;
    let mut readers_buf = vec![0u8; readers_buf_len];
    for (i, reader) in ctx.list_readers(&mut readers_buf)?.enumerate() {
        println!("{}: {:?}", i, reader);
    }
    Ok(())
}

fn scan(ctx: &pcsc::Context, opts: ScanOpts) -> Result<(), Box<dyn Error>> {
    let credentials = DocumentCredentials::new(&opts.document_number, &opts.date_of_birth, &opts.date_of_expiry)?;

    let encoder = match &opts.encoder_config_path {
        Some(path) => read_json::<EncoderConfig>(path)?,
        None => EncoderConfig::default(),
    };
    let merkle_proof = match &opts.merkle_proof_path {
        Some(path) => Some(read_json::<MerkleProofFile>(path)?.into_proof()?),
        None => None,
    };
    let config = ScanConfig {
        exchange_timeout: Duration::from_secs(opts.timeout_secs),
        pace_policy: opts.pace_policy.into(),
        encoder,
        revealed_attributes: opts.revealed_attributes.clone(),
        merkle_proof,
        ..ScanConfig::default()
    };

    let scanner = Scanner::new(config);
    let master_list = std::fs::read(&opts.master_list_path)
        .map_err(|e| format!("failed to read {}: {}", opts.master_list_path.display(), e))?;
    scanner.load_trust_store(&master_list)?;

    let readers_buf_len = ctx.list_readers_len()?;
    let mut readers_buf = vec![0u8; readers_buf_len];
    let reader = ctx.list_readers(&mut readers_buf)?
        .nth(opts.reader_index)
        .ok_or_else(|| format!("no reader at index {}", opts.reader_index))?;
    info!("using reader {:?}", reader);
    let card = ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;

    let outcome = scanner.negotiate_and_read(card, &credentials, &opts.address)?;
    info!(
        "face image: {:?}, {}x{}, {} bytes",
        outcome.face.format, outcome.face.width, outcome.face.height, outcome.face.image_data.len(),
    );
    debug!("signed content:\n{}", mrtd_zk::hexdump(&outcome.record.signed_content_bytes));
    for attribute in &opts.revealed_attributes {
        if let Some(value) = outcome.record.mrz_attribute(*attribute) {
            info!("revealing {}: {:?}", attribute, value);
        }
    }

    if let Some(path) = &opts.face_path {
        std::fs::write(path, &outcome.face.image_data)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    }

    let json = serde_json::to_string_pretty(&outcome.record.to_prover_inputs())?;
    match &opts.output_path {
        Some(path) => std::fs::write(path, json)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))?,
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", json)?;
        },
    }
    Ok(())
}


fn main() -> ExitCode {
    let mode = Mode::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_writer(io::stderr)
        .init();

    let result = pcsc::Context::establish(pcsc::Scope::User)
        .map_err(|e| -> Box<dyn Error> { format!("failed to establish PC/SC user context: {}", e).into() })
        .and_then(|ctx| match mode {
            Mode::ListReaders => list_readers(&ctx),
            Mode::Scan(opts) => scan(&ctx, opts),
        });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_in_both_bases() {
        assert_eq!(parse_address("255").unwrap(), BigUint::from(255u16));
        assert_eq!(parse_address("0xff").unwrap(), BigUint::from(255u16));
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn merkle_proof_from_json() {
        let file: MerkleProofFile = serde_json::from_str(
            r#"{"pathIndices": [0, 1], "siblings": ["12", "34"], "root": "56"}"#
        ).unwrap();
        let proof = file.into_proof().unwrap();
        assert_eq!(proof.path_indices, vec![0, 1]);
        assert_eq!(proof.siblings, vec![BigUint::from(12u8), BigUint::from(34u8)]);
        assert_eq!(proof.root, BigUint::from(56u8));
    }

    #[test]
    fn scan_arguments() {
        let mode = Mode::try_parse_from([
            "mrtd-zk-tool", "scan",
            "--document-number", "L898902C3", "--date-of-birth", "740812", "--date-of-expiry", "120415",
            "--master-list", "ml.der", "--reveal", "nationality", "--reveal", "date_of_birth",
        ]).unwrap();
        let Mode::Scan(opts) = mode else { panic!("expected scan") };
        assert_eq!(opts.revealed_attributes, vec![MrzAttribute::Nationality, MrzAttribute::DateOfBirth]);
        assert_eq!(opts.pace_policy, PacePolicyArg::FallBackToBac);
        assert_eq!(opts.address, BigUint::from(0u8));
    }
}
