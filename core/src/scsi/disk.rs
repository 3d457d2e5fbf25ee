//! SCSI hard disk drive (block device)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::scsi::target::{ScsiTarget, ScsiTargetType};
use crate::scsi::{ScsiCmdResult, STATUS_CHECK_CONDITION};

pub const DISK_BLOCKSIZE: usize = 512;

#[derive(Serialize, Deserialize)]
pub struct ScsiTargetDisk {
    /// Disk contents
    pub(super) disk: Vec<u8>,

    /// Path where the original image resides, if file-backed
    pub(super) path: Option<PathBuf>,

    /// Check condition code
    cc_code: u8,

    /// Check condition ASC
    cc_asc: u16,
}

impl ScsiTargetDisk {
    /// Try to load a disk image, given the filename of the image
    pub fn load_disk(filename: &Path) -> Result<Self> {
        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }

        let disk = fs::read(filename)
            .with_context(|| format!("Failed to open file {}", filename.display()))?;

        if disk.len() % DISK_BLOCKSIZE != 0 {
            bail!(
                "Cannot load disk image {}: not multiple of {}",
                filename.display(),
                DISK_BLOCKSIZE
            );
        }

        Ok(Self {
            disk,
            path: Some(filename.to_path_buf()),
            cc_code: 0,
            cc_asc: 0,
        })
    }

    /// Creates a disk from an in-memory buffer
    pub fn from_buffer(disk: Vec<u8>) -> Result<Self> {
        if disk.len() % DISK_BLOCKSIZE != 0 {
            bail!("Disk buffer not multiple of {}", DISK_BLOCKSIZE);
        }
        Ok(Self {
            disk,
            path: None,
            cc_code: 0,
            cc_asc: 0,
        })
    }
}

impl ScsiTarget for ScsiTargetDisk {
    fn target_type(&self) -> ScsiTargetType {
        ScsiTargetType::Disk
    }

    fn req_sense(&mut self) -> (u8, u16) {
        (self.cc_code, self.cc_asc)
    }

    fn set_cc(&mut self, code: u8, asc: u16) {
        self.cc_code = code;
        self.cc_asc = asc;
    }

    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        Ok(ScsiCmdResult::Status(crate::scsi::STATUS_GOOD))
    }

    fn inquiry(&mut self, _cmd: &[u8]) -> Result<ScsiCmdResult> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier (5-7), peripheral device type (4-0)
        result[0] = 0; // Magnetic disk
                       // Device Type Modifier
        result[1] = 0;

        // SCSI version compliance
        result[2] = 0x02; // ANSI-2
        result[3] = 0x02; // ANSI-2

        // 4 Additional length (N-4), min. 32
        result[4] = result.len() as u8 - 4;

        // 8..16 Vendor identification
        result[8..(8 + 6)].copy_from_slice(b"INDIGO");

        // 16..32 Product identification
        result[16..(16 + 11)].copy_from_slice(b"VIRTUAL HDD");

        // 32..36 Revision
        result[32..35].copy_from_slice(b"1.0");

        Ok(ScsiCmdResult::DataIn(result))
    }

    fn mode_sense_page(&mut self, page: u8) -> Option<Vec<u8>> {
        match page {
            0x01 => {
                // Read/write error recovery page
                Some(vec![
                    0x01,        // Page code
                    0x0A,        // Page length
                    0b1100_0000, // DCR, DTE, PER, EER, RC, TB, ARRE, AWRE
                    8,           // Read retry count
                    0,           // Correction span
                    0,           // Head offset count
                    0,           // Data strobe offset count
                    0,           // Reserved
                    0,           // Write retry count
                    0,           // Reserved
                    0,           // Recovery time limit (MSB)
                    0,           // Recovery time limit (LSB)
                ])
            }
            0x03 => {
                // Format device page
                let mut result = vec![0; 24];
                result[0] = 0x03; // Page code
                result[1] = 0x16; // Page length
                result[14] = (DISK_BLOCKSIZE >> 8) as u8; // Bytes per physical sector (MSB)
                result[15] = (DISK_BLOCKSIZE & 0xFF) as u8; // Bytes per physical sector (LSB)
                Some(result)
            }
            _ => None,
        }
    }

    fn blocksize(&self) -> Option<usize> {
        Some(DISK_BLOCKSIZE)
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.disk.len() / DISK_BLOCKSIZE)
    }

    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8> {
        self.disk[(block_offset * DISK_BLOCKSIZE)..((block_offset + block_count) * DISK_BLOCKSIZE)]
            .to_vec()
    }

    fn write(&mut self, block_offset: usize, data: &[u8]) {
        let offset = block_offset * DISK_BLOCKSIZE;
        self.disk[offset..(offset + data.len())].copy_from_slice(data);
    }

    fn image_fn(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        log::error!("Unknown command {:02X}", cmd[0]);
        self.set_cc(5, 0x2000);
        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::target::ScsiTarget;
    use crate::scsi::STATUS_GOOD;

    fn disk(blocks: usize) -> ScsiTargetDisk {
        let mut data = vec![0u8; blocks * DISK_BLOCKSIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / DISK_BLOCKSIZE) as u8;
        }
        ScsiTargetDisk::from_buffer(data).unwrap()
    }

    #[test]
    fn rejects_unaligned_buffer() {
        assert!(ScsiTargetDisk::from_buffer(vec![0; 100]).is_err());
    }

    #[test]
    fn read_capacity_reports_last_block_and_blocksize() {
        let mut d = disk(16);
        let Ok(ScsiCmdResult::DataIn(data)) =
            d.cmd(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], None)
        else {
            panic!("expected DataIn");
        };
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 15);
        assert_eq!(
            u32::from_be_bytes(data[4..8].try_into().unwrap()),
            DISK_BLOCKSIZE as u32
        );
    }

    #[test]
    fn read6_returns_block_contents() {
        let mut d = disk(16);
        let Ok(ScsiCmdResult::DataIn(data)) = d.cmd(&[0x08, 0, 0, 3, 2, 0], None) else {
            panic!("expected DataIn");
        };
        assert_eq!(data.len(), 2 * DISK_BLOCKSIZE);
        assert!(data[..DISK_BLOCKSIZE].iter().all(|&b| b == 3));
        assert!(data[DISK_BLOCKSIZE..].iter().all(|&b| b == 4));
    }

    #[test]
    fn read_beyond_end_sets_check_condition() {
        let mut d = disk(4);
        let Ok(ScsiCmdResult::Status(s)) = d.cmd(&[0x08, 0, 0, 3, 2, 0], None) else {
            panic!("expected Status");
        };
        assert_eq!(s, STATUS_CHECK_CONDITION);

        // REQUEST SENSE reports and clears the check condition
        let Ok(ScsiCmdResult::DataIn(sense)) = d.cmd(&[0x03, 0, 0, 0, 0, 0], None) else {
            panic!("expected DataIn");
        };
        assert_eq!(sense[2], 5);
        assert_eq!(d.req_sense(), (0, 0));
    }

    #[test]
    fn write6_round_trips() {
        let mut d = disk(8);
        let wr = d.cmd(&[0x0A, 0, 0, 2, 1, 0], None).unwrap();
        let ScsiCmdResult::DataOut(len) = wr else {
            panic!("expected DataOut");
        };
        assert_eq!(len, DISK_BLOCKSIZE);

        let payload = vec![0xA5u8; DISK_BLOCKSIZE];
        let Ok(ScsiCmdResult::Status(s)) = d.cmd(&[0x0A, 0, 0, 2, 1, 0], Some(&payload)) else {
            panic!("expected Status");
        };
        assert_eq!(s, STATUS_GOOD);

        let Ok(ScsiCmdResult::DataIn(data)) = d.cmd(&[0x08, 0, 0, 2, 1, 0], None) else {
            panic!("expected DataIn");
        };
        assert_eq!(data, payload);
    }
}
