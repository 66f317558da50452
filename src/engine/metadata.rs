//! On-disk tier metadata codec.
//!
//! Every disk tier embeds one JSON document carrying the engine's settings
//! snapshot, the tier's highest seqno, the flush timestamp, opaque
//! application bytes, and the per-tier version counters. The document is
//! authoritative at open: version counters resume from it, and a mismatch
//! between stored and requested settings refuses the open.
//!
//! `seqno` and `flushunix` are stringified so the document survives JSON
//! readers that round 64-bit integers through floats.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::{Config, EngineError, NLEVELS};

/// Settings snapshot stored inside each tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSettings {
    /// Redo-log directory; empty when the engine is not durable.
    pub logpath: String,
    pub memstore: String,
    pub diskstore: String,
    pub durable: bool,
    pub workingset: bool,
    pub flushratio: f64,
    pub compactratio: f64,
    pub autocommit_secs: u64,
    pub compactperiod_secs: u64,
    pub memcapacity: u64,
    pub diskpaths: Vec<String>,
    pub mblocksize: u64,
    pub zblocksize: u64,
    pub vblocksize: u64,
    pub mmap: bool,
}

impl StoredSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            logpath: cfg
                .logpath
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            memstore: cfg.memstore.clone(),
            diskstore: cfg.diskstore.clone(),
            durable: cfg.durable,
            workingset: cfg.workingset,
            flushratio: cfg.flushratio,
            compactratio: cfg.compactratio,
            autocommit_secs: cfg.autocommit.as_secs(),
            compactperiod_secs: cfg.compactperiod.as_secs(),
            memcapacity: cfg.memcapacity,
            diskpaths: cfg
                .diskpaths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            mblocksize: cfg.mblocksize as u64,
            zblocksize: cfg.zblocksize as u64,
            vblocksize: cfg.vblocksize as u64,
            mmap: cfg.mmap,
        }
    }
}

/// The per-tier metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMetadata {
    /// Highest seqno absorbed by the tier, stringified.
    pub seqno: String,

    /// Unix seconds of the flush that produced the tier, stringified.
    pub flushunix: String,

    /// Application-supplied opaque bytes, base64.
    pub appdata: String,

    /// Version counters for `mw`, `mr`, `mc` at build time.
    pub memversions: [u32; 3],

    /// Version counters for the sixteen disk slots at build time.
    pub diskversions: [u64; NLEVELS],

    /// Full settings snapshot.
    pub settings: StoredSettings,
}

impl TierMetadata {
    pub fn new(
        seqno: u64,
        flushunix: u64,
        appdata: &[u8],
        memversions: [u32; 3],
        diskversions: [u64; NLEVELS],
        cfg: &Config,
    ) -> Self {
        Self {
            seqno: seqno.to_string(),
            flushunix: flushunix.to_string(),
            appdata: BASE64.encode(appdata),
            memversions,
            diskversions,
            settings: StoredSettings::from_config(cfg),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn seqno(&self) -> Result<u64, EngineError> {
        self.seqno
            .parse()
            .map_err(|_| EngineError::Internal(format!("bad stored seqno {:?}", self.seqno)))
    }

    pub fn flushunix(&self) -> Result<u64, EngineError> {
        self.flushunix.parse().map_err(|_| {
            EngineError::Internal(format!("bad stored flushunix {:?}", self.flushunix))
        })
    }

    pub fn appdata(&self) -> Result<Vec<u8>, EngineError> {
        BASE64
            .decode(&self.appdata)
            .map_err(|e| EngineError::Internal(format!("bad stored appdata: {e}")))
    }

    /// Compare the stored settings against the requested configuration.
    /// Any difference in memstore, diskstore, logpath, diskpaths or builder
    /// block sizes refuses the open.
    pub fn validate_against(&self, cfg: &Config) -> Result<(), EngineError> {
        let requested = StoredSettings::from_config(cfg);
        let stored = &self.settings;

        let mismatch = |what: &str, found: &dyn std::fmt::Display, want: &dyn std::fmt::Display| {
            Err(EngineError::SettingsMismatch(format!(
                "found {what} {found} on disk, expected {want}"
            )))
        };

        if stored.memstore != requested.memstore {
            return mismatch("memstore", &stored.memstore, &requested.memstore);
        }
        if stored.diskstore != requested.diskstore {
            return mismatch("diskstore", &stored.diskstore, &requested.diskstore);
        }
        if cfg.durable && stored.logpath != requested.logpath {
            return mismatch("logpath", &stored.logpath, &requested.logpath);
        }

        let mut found_paths = stored.diskpaths.clone();
        let mut want_paths = requested.diskpaths.clone();
        found_paths.sort();
        want_paths.sort();
        if found_paths != want_paths {
            return mismatch(
                "diskpaths",
                &found_paths.join(","),
                &want_paths.join(","),
            );
        }

        if stored.mblocksize != requested.mblocksize {
            return mismatch("mblocksize", &stored.mblocksize, &requested.mblocksize);
        }
        if stored.zblocksize != requested.zblocksize {
            return mismatch("zblocksize", &stored.zblocksize, &requested.zblocksize);
        }
        if stored.vblocksize != requested.vblocksize {
            return mismatch("vblocksize", &stored.vblocksize, &requested.vblocksize);
        }
        Ok(())
    }
}
