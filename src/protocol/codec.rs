//! Cell framing over a byte stream
//!
//! VERSIONS cells carry a 2-byte circuit id, every other cell a 4-byte one.
//! Before any VERSIONS cell has gone by, a header whose third byte is the
//! VERSIONS code is read as a VERSIONS cell; after that, only 4-byte ids are
//! expected.

use super::cell::{Cell, CellCommand, CELL_BODY_LEN};
use crate::error::Result;

/// Incremental cell decoder/encoder for one relay connection
#[derive(Debug, Clone, Default)]
pub struct CellCodec {
    /// Whether the link has moved past version negotiation
    wide_circ_ids: bool,
}

impl CellCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether 4-byte circuit ids are in use
    pub fn wide_circ_ids(&self) -> bool {
        self.wide_circ_ids
    }

    /// Encode a cell for the wire
    pub fn encode(&mut self, cell: &Cell) -> Result<Vec<u8>> {
        let bytes = cell.to_bytes()?;
        if cell.command() == CellCommand::Versions {
            self.wide_circ_ids = true;
        }
        Ok(bytes)
    }

    /// Decode one cell from the front of `buf`.
    ///
    /// Returns the cell and the number of bytes it occupied, or `None` if
    /// `buf` does not yet hold a complete cell.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Cell, usize)>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        let id_len = if !self.wide_circ_ids && buf[2] == CellCommand::Versions as u8 {
            CellCommand::circ_id_len(buf[2])
        } else {
            4
        };
        if buf.len() < id_len + 1 {
            return Ok(None);
        }

        let circ_id = if id_len == 2 {
            u16::from_be_bytes([buf[0], buf[1]]) as u32
        } else {
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
        };
        let command = buf[id_len];
        let mut pos = id_len + 1;

        let body_len = if CellCommand::is_var_len_code(command) {
            if buf.len() < pos + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            len
        } else {
            CELL_BODY_LEN
        };

        if buf.len() < pos + body_len {
            return Ok(None);
        }

        let cell = Cell::parse(circ_id, command, &buf[pos..pos + body_len])?;
        if command == CellCommand::Versions as u8 {
            self.wide_circ_ids = true;
        }
        log::trace!(
            "decoded {:?} cell on circuit {:#x} ({} bytes)",
            cell.command(),
            circ_id,
            pos + body_len
        );

        Ok(Some((cell, pos + body_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TorError;
    use crate::protocol::cell::{ChanMsg, DestroyReason};

    #[test]
    fn test_decode_versions_then_wide_ids() {
        let mut sender = CellCodec::new();
        let mut stream = sender
            .encode(&Cell::new(0, ChanMsg::Versions { versions: vec![4, 5] }))
            .unwrap();
        assert!(sender.wide_circ_ids());
        stream.extend(
            sender
                .encode(&Cell::destroy(0x8000_0042, DestroyReason::FINISHED))
                .unwrap(),
        );

        let mut codec = CellCodec::new();
        let (first, used) = codec.decode(&stream).unwrap().unwrap();
        assert_eq!(first.msg(), &ChanMsg::Versions { versions: vec![4, 5] });
        assert_eq!(used, 9);
        assert!(codec.wide_circ_ids());

        let (second, used2) = codec.decode(&stream[used..]).unwrap().unwrap();
        assert_eq!(second.circ_id(), 0x8000_0042);
        assert_eq!(used2, 514);
        assert_eq!(used + used2, stream.len());
    }

    #[test]
    fn test_fresh_codec_frames_fixed_cell() {
        let cell = Cell::destroy(0x8000_0042, DestroyReason::NONE);
        let bytes = CellCodec::new().encode(&cell).unwrap();
        assert_eq!(bytes.len(), 514);

        let mut codec = CellCodec::new();
        for cut in 0..bytes.len() {
            assert!(codec.decode(&bytes[..cut]).unwrap().is_none());
        }
        assert_eq!(codec.decode(&bytes).unwrap(), Some((cell, 514)));
        assert!(!codec.wide_circ_ids());
    }

    #[test]
    fn test_partial_input() {
        let mut codec = CellCodec::new();
        let bytes = codec
            .encode(&Cell::new(0, ChanMsg::Versions { versions: vec![4] }))
            .unwrap();
        let mut codec = CellCodec::new();
        for cut in 0..bytes.len() {
            assert!(codec.decode(&bytes[..cut]).unwrap().is_none());
        }

        let fixed = Cell::destroy(1, DestroyReason::NONE).to_bytes().unwrap();
        let mut codec = CellCodec {
            wide_circ_ids: true,
        };
        assert!(codec.decode(&fixed[..fixed.len() - 1]).unwrap().is_none());
        assert!(codec.decode(&fixed).unwrap().is_some());
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let mut codec = CellCodec {
            wide_circ_ids: true,
        };
        let mut bytes = vec![0, 0, 0, 1, 77];
        bytes.resize(5 + CELL_BODY_LEN, 0);
        let err = codec.decode(&bytes).unwrap_err();
        assert_eq!(err, TorError::UnknownCommand(77));
        assert!(err.is_connection_fatal());
    }
}
