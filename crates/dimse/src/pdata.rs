//! Mapping between DIMSE messages and P-DATA-TF PDUs

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use tracing::warn;

use crate::command;
use crate::types::DimseMessage;
use crate::uids::trim_uid;
use crate::{DimseError, Result};

/// PDV item header: item length (4), context id (1), control header (1)
const PDV_HEADER_LEN: u32 = 6;

fn chunk_size(max_pdu_length: u32) -> usize {
    let max = if max_pdu_length == 0 {
        crate::config::default_max_pdu()
    } else {
        max_pdu_length
    };
    max.saturating_sub(PDV_HEADER_LEN).max(1) as usize
}

fn fragment(
    bytes: Vec<u8>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_pdu_length: u32,
    out: &mut Vec<Pdu>,
) {
    let size = chunk_size(max_pdu_length);
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(size).collect()
    };
    let last = chunks.len() - 1;

    for (i, chunk) in chunks.into_iter().enumerate() {
        out.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: value_type.clone(),
                is_last: i == last,
                data: chunk.to_vec(),
            }],
        });
    }
}

/// Encode a message into the P-DATA PDUs to send, in order.
///
/// The command set is always Implicit VR Little Endian; the data set uses
/// the transfer syntax negotiated for its presentation context.
pub fn encode_message(
    message: &DimseMessage,
    transfer_syntax: &str,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    let mut pdus = Vec::new();

    let mut command_bytes = Vec::new();
    message
        .command
        .write_dataset_with_ts(&mut command_bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomObject(format!("could not write command set: {}", e)))?;
    fragment(
        command_bytes,
        message.presentation_context_id,
        PDataValueType::Command,
        max_pdu_length,
        &mut pdus,
    );

    if let Some(dataset) = &message.dataset {
        let ts = TransferSyntaxRegistry
            .get(trim_uid(transfer_syntax))
            .ok_or_else(|| {
                DimseError::NotSupported(format!("transfer syntax {}", transfer_syntax))
            })?;
        let mut dataset_bytes = Vec::new();
        dataset
            .write_dataset_with_ts(&mut dataset_bytes, ts)
            .map_err(|e| DimseError::DicomObject(format!("could not write data set: {}", e)))?;
        fragment(
            dataset_bytes,
            message.presentation_context_id,
            PDataValueType::Data,
            max_pdu_length,
            &mut pdus,
        );
    }

    Ok(pdus)
}

/// Reassembles incoming PDVs into whole DIMSE messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command_buffer: Vec<u8>,
    data_buffer: Vec<u8>,
    pending: Option<(u8, InMemDicomObject)>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one PDV; returns a message once its last fragment has arrived.
    ///
    /// `transfer_syntax_of` resolves the negotiated transfer syntax of a
    /// presentation context ID. A data set that cannot be decoded still
    /// yields its command, with `dataset` left empty.
    pub fn push<F>(
        &mut self,
        pdv: PDataValue,
        transfer_syntax_of: F,
    ) -> Result<Option<DimseMessage>>
    where
        F: Fn(u8) -> Option<String>,
    {
        match pdv.value_type {
            PDataValueType::Command => {
                self.command_buffer.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }

                let bytes = std::mem::take(&mut self.command_buffer);
                let command = InMemDicomObject::read_dataset_with_ts(
                    bytes.as_slice(),
                    &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                )
                .map_err(|e| DimseError::DicomParsing(format!("invalid command set: {}", e)))?;

                if command::has_dataset(&command) {
                    self.data_buffer.clear();
                    self.pending = Some((pdv.presentation_context_id, command));
                    Ok(None)
                } else {
                    Ok(Some(DimseMessage::new(pdv.presentation_context_id, command)))
                }
            }
            PDataValueType::Data => {
                self.data_buffer.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }

                let (pc_id, command) = self.pending.take().ok_or_else(|| {
                    DimseError::DicomParsing("data set received without a command".into())
                })?;
                let bytes = std::mem::take(&mut self.data_buffer);

                let ts_uid = transfer_syntax_of(pc_id).ok_or_else(|| {
                    DimseError::DicomParsing(format!("unknown presentation context {}", pc_id))
                })?;
                let ts = TransferSyntaxRegistry.get(trim_uid(&ts_uid)).ok_or_else(|| {
                    DimseError::NotSupported(format!("transfer syntax {}", ts_uid))
                })?;
                match InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts) {
                    Ok(dataset) => {
                        Ok(Some(DimseMessage::new(pc_id, command).with_dataset(dataset)))
                    }
                    Err(e) => {
                        warn!("Discarding undecodable data set ({} bytes): {}", bytes.len(), e);
                        Ok(Some(DimseMessage::new(pc_id, command)))
                    }
                }
            }
        }
    }

    /// Drop any partial state, e.g. after a failed receive
    pub fn reset(&mut self) {
        self.command_buffer.clear();
        self.data_buffer.clear();
        self.pending = None;
    }
}
