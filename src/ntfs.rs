//! NTFS allocation-bitmap extraction.
//!
//! NTFS stores the volume cluster bitmap as an ordinary file: MFT record 6,
//! `$Bitmap`. Extraction parses the boot sector for the geometry, reads and
//! fixes up record 6, walks its attribute list for the non-resident `$DATA`
//! attribute, decodes the runlist and stitches the fragments back together.
//! The stitched file content *is* the bitmap.

use crate::device::{read_full_at, ReadAt};
use crate::endian::{pad_to_8, LeReader};
use crate::error::{Error, Result};

const BOOT_SECTOR_SIZE: usize = 512;
const BITMAP_MFT_INDEX: u64 = 6;
const FILE_SIGNATURE: &[u8] = b"FILE";

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_TERMINATOR: u32 = 0xFFFF_FFFF;

/// Geometry fields of the NTFS boot sector.
#[derive(Debug, Clone, Copy)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_start_cluster: u64,
    /// Positive: clusters per MFT record. Negative: `2^(-v)` bytes.
    bytes_or_clusters_per_record: i8,
}

impl BootSector {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return Err(Error::NtfsBoot(format!(
                "boot sector is {} bytes, expected {BOOT_SECTOR_SIZE}",
                sector.len()
            )));
        }
        let r = LeReader::new(sector);
        let bs = BootSector {
            bytes_per_sector: r.u16(0x0B),
            sectors_per_cluster: r.byte(0x0D),
            total_sectors: r.u64(0x28),
            mft_start_cluster: r.u64(0x30),
            bytes_or_clusters_per_record: r.i8(0x40),
        };
        let end_marker = r.u16(0x1FE);
        if end_marker != 0xAA55 {
            return Err(Error::NtfsBoot(format!(
                "invalid end-of-sector marker {end_marker:#06x}"
            )));
        }
        if bs.bytes_per_sector == 0 || bs.bytes_per_sector % 512 != 0 {
            return Err(Error::NtfsBoot(format!(
                "invalid bytes per sector {}",
                bs.bytes_per_sector
            )));
        }
        let cluster = bs.cluster_size();
        if cluster == 0 || cluster > 0x10000 || !cluster.is_power_of_two() {
            return Err(Error::NtfsBoot(format!("invalid cluster size {cluster}")));
        }
        if bs.total_clusters() == 0 {
            return Err(Error::NtfsBoot("cluster number is 0".into()));
        }
        Ok(bs)
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn total_clusters(&self) -> u64 {
        if self.sectors_per_cluster == 0 {
            return 0;
        }
        self.total_sectors / self.sectors_per_cluster as u64
    }

    /// Bytes per MFT file record segment.
    pub fn record_size(&self) -> Result<u64> {
        let v = self.bytes_or_clusters_per_record;
        if v > 0 {
            Ok(v as u64 * self.cluster_size() as u64)
        } else if v < 0 {
            Ok(1u64 << (-v as u32))
        } else {
            Err(Error::NtfsBoot("invalid length of file record segment".into()))
        }
    }
}

/// Apply the update-sequence fixup to a metadata record in place.
///
/// The last two bytes of every sector carry the update sequence number for
/// torn-write detection; the true values sit in the update sequence array
/// and are swapped back in before the record may be parsed.
pub fn apply_fixup(record: &mut [u8]) -> Result<()> {
    let r = LeReader::new(record);
    let usa_offset = r.u16(0x04) as usize;
    let usa_pairs = r.u16(0x06) as usize;
    let usa_end = usa_offset + usa_pairs * 2;
    if usa_pairs < 2 || usa_end > record.len() {
        return Err(Error::NtfsFixup(format!(
            "update sequence [{usa_offset}, {usa_end}) does not fit record of {} bytes",
            record.len()
        )));
    }

    let usn = [record[usa_offset], record[usa_offset + 1]];
    let array: Vec<u8> = record[usa_offset + 2..usa_end].to_vec();
    let sector_count = array.len() / 2;
    let sector_size = record.len() / sector_count;

    for i in 1..=sector_count {
        let at = sector_size * i - 2;
        if record[at..at + 2] != usn {
            return Err(Error::NtfsFixup(format!("update sequence mismatch at pos {at}")));
        }
    }
    for i in 0..sector_count {
        let at = sector_size * (i + 1) - 2;
        record[at..at + 2].copy_from_slice(&array[i * 2..i * 2 + 2]);
    }
    Ok(())
}

/// One attribute of an MFT record, with its raw value.
#[derive(Debug)]
pub struct Attribute {
    pub type_code: u32,
    pub resident: bool,
    pub name: String,
    pub data: Vec<u8>,
}

/// Walk the attribute list starting at `b` until the terminator type.
pub fn parse_attributes(b: &[u8]) -> Result<Vec<Attribute>> {
    let mut attributes = Vec::new();
    let mut rest = b;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::NtfsAttribute(format!(
                "attribute header should be at least 4 bytes but is {}",
                rest.len()
            )));
        }
        let r = LeReader::new(rest);
        if r.u32(0) == ATTR_TERMINATOR {
            break;
        }
        if rest.len() < 8 {
            return Err(Error::NtfsAttribute(
                "can not read attribute record length".into(),
            ));
        }
        let record_length = r.u32(0x04) as usize;
        if record_length == 0 || record_length > rest.len() {
            return Err(Error::NtfsAttribute(format!(
                "attribute record length {record_length} exceeds remaining {} bytes",
                rest.len()
            )));
        }
        attributes.push(parse_attribute(&rest[..record_length])?);
        rest = &rest[record_length..];
    }
    Ok(attributes)
}

fn parse_attribute(b: &[u8]) -> Result<Attribute> {
    if b.len() < 22 {
        return Err(Error::NtfsAttribute(format!(
            "attribute should be at least 22 bytes but is {}",
            b.len()
        )));
    }
    let r = LeReader::new(b);

    let name_length = r.byte(0x09) as usize;
    let name_offset = r.u16(0x0A) as usize;
    let name = if name_length != 0 {
        if name_offset + name_length * 2 > b.len() {
            return Err(Error::NtfsAttribute("attribute name out of bounds".into()));
        }
        decode_utf16le(r.bytes(name_offset, name_length * 2))
    } else {
        String::new()
    };

    let resident = r.byte(0x08) == 0x00;
    let data = if resident {
        let data_offset = r.u16(0x14) as usize;
        let data_length = r.u32(0x10) as usize;
        if data_offset + data_length > b.len() {
            return Err(Error::NtfsAttribute(format!(
                "resident value [{data_offset}, +{data_length}) out of bounds"
            )));
        }
        r.bytes(data_offset, data_length).to_vec()
    } else {
        let data_offset = r.u16(0x20) as usize;
        if data_offset > b.len() {
            return Err(Error::NtfsAttribute(format!(
                "runlist offset {data_offset} out of bounds"
            )));
        }
        r.tail(data_offset).to_vec()
    };

    Ok(Attribute {
        type_code: r.u32(0),
        resident,
        name,
        data,
    })
}

/// Decoded `$FILE_NAME` attribute value, reduced to what extraction checks.
pub fn parse_file_name(b: &[u8]) -> Result<String> {
    if b.len() < 66 {
        return Err(Error::NtfsAttribute(format!(
            "$FILE_NAME should be at least 66 bytes but is {}",
            b.len()
        )));
    }
    let name_length = b[0x40] as usize * 2;
    if 0x42 + name_length > b.len() {
        return Err(Error::NtfsAttribute("file name out of bounds".into()));
    }
    Ok(decode_utf16le(&b[0x42..0x42 + name_length]))
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// One entry of a non-resident attribute's runlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub length_clusters: u64,
    /// Cluster offset relative to the previous run's absolute offset.
    pub offset_delta: i64,
}

/// Decode a runlist. The header byte's low nibble counts length bytes, the
/// high nibble counts offset bytes; a zero header terminates. Length fields
/// are unsigned, offset fields are signed.
pub fn parse_data_runs(b: &[u8]) -> Result<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut rest = b;
    while let Some(&header) = rest.first() {
        if header == 0 {
            break;
        }
        let length_len = (header & 0x0F) as usize;
        let offset_len = (header >> 4) as usize;
        let total = 1 + length_len + offset_len;
        if rest.len() < total {
            return Err(Error::NtfsDataRun(format!(
                "expected at least {total} bytes of datarun data but got {}",
                rest.len()
            )));
        }

        let mut length_bytes = [0u8; 8];
        length_bytes[..length_len.min(8)].copy_from_slice(&rest[1..1 + length_len.min(8)]);
        let length_clusters = u64::from_le_bytes(length_bytes);

        let offset_bytes = &rest[1 + length_len..total];
        let offset_delta = i64::from_le_bytes(pad_to_8(offset_bytes));

        runs.push(DataRun {
            length_clusters,
            offset_delta,
        });
        rest = &rest[total..];
    }
    Ok(runs)
}

/// Absolute byte extent of one datarun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: u64,
    pub length: u64,
}

/// Resolve relative runs into absolute byte fragments. Offsets accumulate:
/// each run's delta is applied to the previous run's absolute cluster.
pub fn runs_to_fragments(runs: &[DataRun], cluster_size: u32) -> Result<Vec<Fragment>> {
    let mut fragments = Vec::with_capacity(runs.len());
    let mut previous_cluster = 0i64;
    for run in runs {
        let absolute = previous_cluster + run.offset_delta;
        if absolute < 0 {
            return Err(Error::NtfsDataRun(format!(
                "datarun resolves to negative cluster {absolute}"
            )));
        }
        fragments.push(Fragment {
            offset: absolute as u64 * cluster_size as u64,
            length: run.length_clusters * cluster_size as u64,
        });
        previous_cluster = absolute;
    }
    Ok(fragments)
}

/// Extract `(cluster_size, bitmap)` from a device holding an NTFS volume.
pub fn extract(dev: &dyn ReadAt) -> Result<(u32, Vec<u8>)> {
    let mut boot = vec![0u8; BOOT_SECTOR_SIZE];
    let n = read_full_at(dev, &mut boot, 0)?;
    if n != BOOT_SECTOR_SIZE {
        return Err(Error::NtfsBoot(format!("short boot sector read ({n} bytes)")));
    }
    let bs = BootSector::parse(&boot)?;
    let cluster_size = bs.cluster_size();
    let record_size = bs.record_size()?;
    log::debug!(
        "ntfs extract: cluster_size={cluster_size} record_size={record_size} mft_cluster={}",
        bs.mft_start_cluster
    );

    // MFT record 6 is $Bitmap by fixed layout.
    let record_offset =
        bs.mft_start_cluster * cluster_size as u64 + BITMAP_MFT_INDEX * record_size;
    let mut record = vec![0u8; record_size as usize];
    let n = read_full_at(dev, &mut record, record_offset)?;
    if n != record.len() {
        return Err(Error::NtfsAttribute(format!(
            "short MFT record read at {record_offset} ({n} bytes)"
        )));
    }
    if &record[..4] != FILE_SIGNATURE {
        return Err(Error::NtfsAttribute(format!(
            "unknown record signature {:02x?}",
            &record[..4]
        )));
    }
    apply_fixup(&mut record)?;

    let first_attr_offset = LeReader::new(&record).u16(0x14) as usize;
    if first_attr_offset >= record.len() {
        return Err(Error::NtfsAttribute(format!(
            "invalid first attribute offset {first_attr_offset}"
        )));
    }
    let attributes = parse_attributes(&record[first_attr_offset..])?;

    for attr in attributes.iter().filter(|a| a.type_code == ATTR_FILE_NAME) {
        let name = parse_file_name(&attr.data)?;
        if name != "$Bitmap" {
            return Err(Error::NtfsAttribute(format!(
                "record 6 names `{name}`, not $Bitmap"
            )));
        }
    }

    let data_attr = attributes
        .iter()
        .find(|a| a.type_code == ATTR_DATA)
        .ok_or_else(|| Error::NtfsAttribute("record 6 lacks a $DATA attribute".into()))?;
    if data_attr.resident {
        return Err(Error::NtfsAttribute("$Bitmap $DATA attribute is resident".into()));
    }

    let runs = parse_data_runs(&data_attr.data)?;
    let fragments = runs_to_fragments(&runs, cluster_size)?;

    let mut bitmap = Vec::new();
    for frag in fragments.iter().filter(|f| f.length != 0) {
        log::debug!("ntfs extract: fragment offset={} length={}", frag.offset, frag.length);
        let mut content = vec![0u8; frag.length as usize];
        let n = read_full_at(dev, &mut content, frag.offset)?;
        if n != content.len() {
            return Err(Error::NtfsDataRun(format!(
                "short fragment read at {} ({n} of {} bytes)",
                frag.offset, frag.length
            )));
        }
        bitmap.extend_from_slice(&content);
    }
    log::debug!("ntfs extract: bitmap size {}", bitmap.len());

    debug_assert!(bitmap.len() as u64 * 8 >= bs.total_clusters());
    Ok((cluster_size, bitmap))
}
