//! The EMV read sequence as an explicit state machine
//!
//! ```text
//! Idle -> PpseSelected -> AidSelected -> GpoDone -> RecordsRead
//!      -> AcGenerated -> DataRetrieved -> LogsRetrieved -> Finalized
//! ```
//!
//! Each [`EmvWorkflow::step`] runs the phase that leaves the current state.
//! Any non-terminal state can move to `Failed`, and only on a transport
//! failure, cancellation or the overall deadline. A card answering with an
//! error status word never stops the sequence. Every exchange is appended to
//! the [`ApduLog`]; fields are extracted from the log, not carried between
//! phases.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use emv_ca_keys::CaKeyStore;
use emv_common::{find_tag_recursive, tags, StatusWord};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::apdu::{commands, ApduCommand, ApduResponse, CryptogramType, MAX_SHORT_DATA};
use crate::card_data::{EmvCardData, GenerateAcResult};
use crate::config::ReaderConfig;
use crate::dol::DolBuilder;
use crate::error::{ConfigError, TransportError, WorkflowError};
use crate::extract::Extractor;
use crate::log::{ApduLog, ApduLogEntry};
use crate::protocol::{aids, AidEntry};
use crate::security::aip_bits;
use crate::transport::Transport;

/// Default DDOL when the card supplies none: the unpredictable number
const DEFAULT_DDOL: [u8; 3] = [0x9F, 0x37, 0x04];

/// Records read from a contact PSE directory file before giving up
const MAX_DIRECTORY_RECORDS: u8 = 16;

/// Overhead of the command template (83, two or three length bytes) around PDOL data
const GPO_TEMPLATE_OVERHEAD: usize = 3;

/// Chained 61xx answers followed before giving up
const MAX_GET_RESPONSE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkflowState {
    Idle,
    PpseSelected,
    AidSelected,
    GpoDone,
    RecordsRead,
    AcGenerated,
    DataRetrieved,
    LogsRetrieved,
    Finalized,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Finalized | WorkflowState::Failed)
    }

    /// State reached when the phase leaving this one completes
    pub fn next(&self) -> Option<WorkflowState> {
        use WorkflowState::*;
        match self {
            Idle => Some(PpseSelected),
            PpseSelected => Some(AidSelected),
            AidSelected => Some(GpoDone),
            GpoDone => Some(RecordsRead),
            RecordsRead => Some(AcGenerated),
            AcGenerated => Some(DataRetrieved),
            DataRetrieved => Some(LogsRetrieved),
            LogsRetrieved => Some(Finalized),
            Finalized | Failed => None,
        }
    }

    /// Name of the phase that leaves this state
    pub fn phase(&self) -> &'static str {
        use WorkflowState::*;
        match self {
            Idle => "PPSE selection",
            PpseSelected => "AID selection",
            AidSelected => "get processing options",
            GpoDone => "read records",
            RecordsRead => "generate AC",
            AcGenerated => "get data",
            DataRetrieved => "transaction logs",
            LogsRetrieved => "finalize",
            Finalized | Failed => "none",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared stop flag, checked before every phase and every exchange
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives the finalized card record
pub trait CardDataSink {
    fn store(&mut self, card: &EmvCardData);
}

impl CardDataSink for Vec<EmvCardData> {
    fn store(&mut self, card: &EmvCardData) {
        self.push(card.clone());
    }
}

/// One read of one card over one transport
///
/// The workflow borrows the transport mutably for its whole life, so two
/// workflows can never interleave on the same reader.
pub struct EmvWorkflow<'t> {
    transport: &'t mut dyn Transport,
    config: ReaderConfig,
    default_aids: Vec<AidEntry>,
    get_data_tags: Vec<Vec<u8>>,
    dol: DolBuilder,
    ca_keys: Option<CaKeyStore>,
    cancel: CancelToken,
    state: WorkflowState,
    log: ApduLog,
    started: Option<Instant>,
    card: Option<EmvCardData>,
}

impl<'t> EmvWorkflow<'t> {
    pub fn new(
        transport: &'t mut dyn Transport,
        config: ReaderConfig,
    ) -> Result<Self, ConfigError> {
        let default_aids = config.default_aid_entries()?;
        let get_data_tags = config.get_data_tag_bytes()?;
        let dol = config.dol_builder()?;
        transport.set_timeout(config.exchange_timeout());
        Ok(Self {
            transport,
            config,
            default_aids,
            get_data_tags,
            dol,
            ca_keys: None,
            cancel: CancelToken::new(),
            state: WorkflowState::Idle,
            log: ApduLog::new(),
            started: None,
            card: None,
        })
    }

    /// CA keys for issuer key recovery (ROCA test)
    pub fn with_ca_keys(mut self, store: CaKeyStore) -> Self {
        self.ca_keys = Some(store);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the DOL builder derived from the config
    pub fn with_dol_builder(mut self, dol: DolBuilder) -> Self {
        self.dol = dol;
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Every exchange so far; kept intact when the workflow fails
    pub fn log(&self) -> &ApduLog {
        &self.log
    }

    pub fn into_log(self) -> ApduLog {
        self.log
    }

    /// The finalized record, once the workflow reached `Finalized`
    pub fn card_data(&self) -> Option<&EmvCardData> {
        self.card.as_ref()
    }

    /// Run the phase leaving the current state
    pub fn step(&mut self) -> Result<WorkflowState, WorkflowError> {
        if self.state.is_terminal() {
            return Err(WorkflowError::Finished(self.state));
        }
        self.started.get_or_insert_with(Instant::now);

        let outcome = self.check_interrupt().and_then(|()| match self.state {
            WorkflowState::Idle => self.select_ppse(),
            WorkflowState::PpseSelected => self.select_application(),
            WorkflowState::AidSelected => self.get_processing_options(),
            WorkflowState::GpoDone => self.read_records(),
            WorkflowState::RecordsRead => self.generate_ac(),
            WorkflowState::AcGenerated => self.get_data(),
            WorkflowState::DataRetrieved => self.read_transaction_log(),
            WorkflowState::LogsRetrieved => {
                self.finalize();
                Ok(())
            }
            WorkflowState::Finalized | WorkflowState::Failed => Ok(()),
        });

        match outcome {
            Ok(()) => {
                let from = self.state;
                self.state = from.next().unwrap_or(WorkflowState::Failed);
                info!(from = %from, to = %self.state, phase = from.phase(), "Phase complete");
                Ok(self.state)
            }
            Err(e) => {
                warn!(
                    state = %self.state,
                    error = %e,
                    exchanges = self.log.len(),
                    "Workflow failed"
                );
                self.state = WorkflowState::Failed;
                Err(e)
            }
        }
    }

    /// Step until `Finalized` or `Failed`
    pub fn run(&mut self) -> Result<EmvCardData, WorkflowError> {
        while !self.state.is_terminal() {
            self.step()?;
        }
        self.card
            .clone()
            .ok_or(WorkflowError::Finished(self.state))
    }

    /// Run and hand the finalized record to `sink`
    pub fn run_into(&mut self, sink: &mut dyn CardDataSink) -> Result<(), WorkflowError> {
        let card = self.run()?;
        sink.store(&card);
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), WorkflowError> {
        if self.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled { state: self.state });
        }
        if let (Some(deadline), Some(started)) = (self.config.overall_deadline(), self.started) {
            if started.elapsed() > deadline {
                return Err(WorkflowError::DeadlineExceeded {
                    state: self.state,
                    deadline,
                });
            }
        }
        Ok(())
    }

    fn transport_failure(&self, source: TransportError) -> WorkflowError {
        match source {
            TransportError::Cancelled => WorkflowError::Cancelled { state: self.state },
            source => WorkflowError::Transport {
                state: self.state,
                source,
            },
        }
    }

    /// One transmit, appended to the log whatever its timing
    ///
    /// The exchange timeout is handed to the transport, which stops waiting
    /// where the reader allows it (PN532). It is checked again once the answer
    /// is in: a late answer is still logged, then fails the phase as a timeout.
    fn transmit_logged(
        &mut self,
        bytes: Vec<u8>,
        description: &str,
        origin: Option<&[u8]>,
    ) -> Result<ApduResponse, WorkflowError> {
        self.check_interrupt()?;

        let started = Instant::now();
        let raw = self
            .transport
            .transmit(&bytes)
            .map_err(|e| self.transport_failure(e))?;
        let elapsed = started.elapsed();

        let response = ApduResponse::from_raw(&raw);
        if let Ok(response) = &response {
            debug!(
                command = %hex::encode_upper(&bytes),
                sw = %response.status(),
                len = response.data.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "{description}"
            );
        }
        if let Some(entry) = ApduLogEntry::new(bytes, raw, description, elapsed) {
            self.log.append(match origin {
                Some(original) => entry.answering(original),
                None => entry,
            });
        }

        let timeout = self.config.exchange_timeout();
        if elapsed > timeout {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "{description} answered late"
            );
            return Err(self.transport_failure(TransportError::Timeout(timeout)));
        }
        response.map_err(|e| self.transport_failure(e))
    }

    /// Send one command, following 61xx and 6Cxx the way T=0 cards expect
    fn exchange(
        &mut self,
        command: ApduCommand,
        description: &str,
    ) -> Result<ApduResponse, WorkflowError> {
        let original = command.build().map_err(|e| self.transport_failure(e))?;
        let mut response = self.transmit_logged(original.clone(), description, None)?;

        if response.sw1 == 0x6C {
            let resend = command
                .le(response.sw2)
                .build()
                .map_err(|e| self.transport_failure(e))?;
            response = self.transmit_logged(resend, description, None)?;
        }

        for _ in 0..MAX_GET_RESPONSE {
            if response.sw1 != 0x61 {
                break;
            }
            let fetch = commands::get_response(response.sw2)
                .build()
                .map_err(|e| self.transport_failure(e))?;
            let label = format!("GET RESPONSE ({description})");
            response = self.transmit_logged(fetch, &label, Some(&original))?;
        }

        let status = response.status();
        if !status.is_success() && !status.is_warning() {
            warn!(sw = %status, meaning = %status.describe(), "{description} declined");
        }
        Ok(response)
    }

    fn extractor(&self) -> Extractor<'_> {
        Extractor::new(&self.log)
    }

    /// Build DOL data; a malformed DOL, or one asking for more than `limit`
    /// bytes, counts as absent
    fn dol_data(&self, dol: Option<&[u8]>, name: &str, limit: usize) -> Option<Vec<u8>> {
        let dol = dol?;
        match self.dol.build(dol) {
            Ok(data) if data.len() > limit => {
                warn!(
                    dol = name,
                    requested = data.len(),
                    limit,
                    raw = %hex::encode_upper(dol),
                    "DOL asks for more data than one command carries"
                );
                None
            }
            Ok(data) => Some(data),
            Err(e) => {
                warn!(dol = name, error = %e, raw = %hex::encode_upper(dol), "Malformed DOL");
                None
            }
        }
    }

    /// Phase 1: PPSE, else the contact PSE and its directory file
    fn select_ppse(&mut self) -> Result<(), WorkflowError> {
        let response = self.exchange(commands::select(aids::PPSE), "SELECT PPSE")?;
        if response.is_success() {
            return Ok(());
        }

        let response = self.exchange(commands::select(aids::PSE), "SELECT PSE")?;
        if !response.is_success() {
            return Ok(());
        }
        let directory = find_tag_recursive(&response.data, tags::SHORT_FILE_IDENTIFIER.bytes());
        let Some(&sfi) = directory.and_then(<[u8]>::first) else {
            debug!("PSE names no directory file");
            return Ok(());
        };

        for record in 1..=MAX_DIRECTORY_RECORDS {
            let description = format!("READ RECORD PSE SFI {sfi} #{record}");
            let response = self.exchange(commands::read_record(record, sfi), &description)?;
            if !response.is_success() {
                break;
            }
        }
        Ok(())
    }

    /// Phase 2
    fn select_application(&mut self) -> Result<(), WorkflowError> {
        let mut candidates = self.extractor().directory_entries();
        if candidates.is_empty() {
            info!("Card listed no applications, trying default AIDs");
            candidates = self.default_aids.clone();
        }

        for candidate in &candidates {
            let description = format!("SELECT {}", candidate.display_name());
            let response = self.exchange(commands::select(&candidate.aid), &description)?;
            if self.config.is_selection_success(response.status()) {
                info!(
                    aid = %candidate.aid_hex(),
                    label = %candidate.display_name(),
                    "Application selected"
                );
                return Ok(());
            }
        }

        warn!(tried = candidates.len(), "No application accepted selection");
        Ok(())
    }

    /// Phase 3
    fn get_processing_options(&mut self) -> Result<(), WorkflowError> {
        let pdol = self.extractor().find(tags::PDOL.bytes()).map(<[u8]>::to_vec);
        let pdol_data = self
            .dol_data(pdol.as_deref(), "PDOL", MAX_SHORT_DATA - GPO_TEMPLATE_OVERHEAD)
            .unwrap_or_default();
        self.exchange(commands::get_processing_options(&pdol_data), "GET PROCESSING OPTIONS")?;

        let extractor = self.extractor();
        match (extractor.aip(), extractor.afl()) {
            (Some(aip), afl) => debug!(
                aip = %hex::encode_upper(aip),
                afl = %afl.map(hex::encode_upper).unwrap_or_default(),
                "Processing options"
            ),
            (None, _) => warn!("No AIP in processing options"),
        }
        Ok(())
    }

    /// Phase 4
    fn read_records(&mut self) -> Result<(), WorkflowError> {
        let afl = self.extractor().afl_entries();

        if afl.is_empty() {
            if !self.config.scan_records_without_afl {
                warn!("No AFL, skipping record reads");
                return Ok(());
            }
            info!("No AFL, probing SFI 1-3");
            for sfi in 1..=3u8 {
                for record in 1..=4u8 {
                    let description = format!("READ RECORD SFI {sfi} #{record} (scan)");
                    let response =
                        self.exchange(commands::read_record(record, sfi), &description)?;
                    if matches!(
                        response.status(),
                        StatusWord::RECORD_NOT_FOUND | StatusWord::FILE_NOT_FOUND
                    ) {
                        break;
                    }
                }
            }
            return Ok(());
        }

        for entry in afl {
            for record in entry.records() {
                let description = format!("READ RECORD SFI {} #{record}", entry.sfi);
                self.exchange(commands::read_record(record, entry.sfi), &description)?;
            }
        }
        Ok(())
    }

    /// Phase 5: INTERNAL AUTHENTICATE when DDA is offered, then GENERATE AC
    fn generate_ac(&mut self) -> Result<(), WorkflowError> {
        let aip = self.extractor().aip().and_then(|a| a.first().copied()).unwrap_or(0);
        if aip & aip_bits::DDA != 0 {
            let ddol = self
                .extractor()
                .find(tags::DDOL.bytes())
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| DEFAULT_DDOL.to_vec());
            if let Some(data) = self.dol_data(Some(&ddol), "DDOL", MAX_SHORT_DATA) {
                self.exchange(commands::internal_authenticate(data), "INTERNAL AUTHENTICATE")?;
            }
        }

        let cdol1 = self.extractor().find(tags::CDOL1.bytes()).map(<[u8]>::to_vec);
        let Some(cdol1) = cdol1 else {
            warn!("No CDOL1, skipping GENERATE AC");
            return Ok(());
        };
        let Some(data) = self.dol_data(Some(&cdol1), "CDOL1", MAX_SHORT_DATA) else {
            return Ok(());
        };

        let first = self.config.first_ac_type;
        let response = self.exchange(
            commands::generate_ac(first, data),
            &format!("GENERATE AC ({})", first.name()),
        )?;
        if !response.is_success() {
            return Ok(());
        }

        let result = GenerateAcResult::parse(&response.data);
        info!(
            requested = first.name(),
            returned = result.returned_type().map(|t| t.name()).unwrap_or("unknown"),
            "Application cryptogram"
        );

        if result.returned_type() == Some(CryptogramType::Arqc) {
            let cdol2 = self.extractor().find(tags::CDOL2.bytes()).map(<[u8]>::to_vec);
            if let Some(data) = self.dol_data(cdol2.as_deref(), "CDOL2", MAX_SHORT_DATA) {
                self.exchange(
                    commands::generate_ac(CryptogramType::Aac, data),
                    "GENERATE AC (AAC, second)",
                )?;
            }
        }
        Ok(())
    }

    /// Phase 6
    fn get_data(&mut self) -> Result<(), WorkflowError> {
        for tag in self.get_data_tags.clone() {
            let name = emv_common::get_tag_name(&tag);
            let description = format!("GET DATA {} ({name})", hex::encode_upper(&tag));
            let Some(command) = commands::get_data(&tag) else {
                warn!(tag = %hex::encode_upper(&tag), "GET DATA takes one or two byte tags");
                continue;
            };
            let response = self.exchange(command, &description)?;
            if !response.is_success() {
                debug!(tag = %hex::encode_upper(&tag), "Data object not available");
            }
        }
        Ok(())
    }

    /// Phase 7
    fn read_transaction_log(&mut self) -> Result<(), WorkflowError> {
        let extractor = self.extractor();
        let (Some(_), Some((sfi, count))) = (extractor.log_format(), extractor.log_location())
        else {
            debug!("No log format, no transaction log to read");
            return Ok(());
        };

        for record in 1..=count {
            let description = format!("READ LOG SFI {sfi} #{record}");
            let response = self.exchange(commands::read_record(record, sfi), &description)?;
            if response.status() == StatusWord::RECORD_NOT_FOUND {
                break;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) {
        let card = self.extractor().card_data(self.ca_keys.as_ref());
        info!(
            aid = %card.application_id,
            pan = %card.masked_pan,
            aip = %card.aip,
            weak = card.security.is_weak,
            roca = card.roca.vulnerable,
            exchanges = card.exchanges,
            "Card read complete"
        );
        self.card = Some(card);
    }
}
