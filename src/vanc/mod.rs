//! AncillaryEncoder: caption and format-description metadata into device
//! ancillary lines, rendered with the wire packing rule.

pub mod afd;
pub mod cdp;

use tracing::warn;

use crate::error::{OutputError, Result};
use crate::frame::SideData;
use crate::pack;
use crate::VideoConfig;

use afd::{aspect_for_resolution, AfdPacket};
use cdp::CdpEncoder;

/// Conventional target lines.
pub const CAPTION_LINE: u32 = 11;
pub const AFD_LINE: u32 = 12;

const DID_CAPTIONS: u8 = 0x61;
const SDID_CAPTIONS: u8 = 0x01;
const DID_AFD: u8 = 0x41;
const SDID_AFD: u8 = 0x05;

// Blanking neutral values for unused sample positions.
const CHROMA_NEUTRAL: u16 = 0x200;
const LUMA_BLACK: u16 = 0x040;

/// 10-bit protocol word for one byte: even parity in bit 8, its inverse in
/// bit 9.
fn parity_word(b: u8) -> u16 {
    let parity = (b.count_ones() & 1) as u16;
    b as u16 | parity << 8 | (1 - parity) << 9
}

/// Frame one ancillary packet into its wire word sequence: data flag, DID,
/// SDID, data count, payload, checksum.
pub fn packet_words(did: u8, sdid: u8, payload: &[u8]) -> Vec<u16> {
    let mut words = Vec::with_capacity(payload.len() + 7);
    words.extend_from_slice(&[0x000, 0x3FF, 0x3FF]);
    words.push(parity_word(did));
    words.push(parity_word(sdid));
    words.push(parity_word(payload.len() as u8));
    words.extend(payload.iter().map(|&b| parity_word(b)));
    // 9-bit sum of everything after the flag, bit 9 the inverse of bit 8.
    let sum = words[3..].iter().fold(0u16, |a, &w| (a + w) & 0x1FF);
    words.push(sum | (!sum & 0x100) << 1);
    words
}

/// One accepted unit awaiting render.
#[derive(Debug, Clone)]
pub struct VancLine {
    pub line: u32,
    pub words: Vec<u16>,
}

/// Ordered per-frame set of ancillary units, one unit per line.
#[derive(Debug, Default)]
pub struct VancLineSet {
    lines: Vec<VancLine>,
}

impl VancLineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a unit for `line`. A second unit on an occupied line is
    /// rejected without touching already-accepted units.
    pub fn insert(&mut self, line: u32, words: Vec<u16>) -> Result<()> {
        if self.lines.iter().any(|l| l.line == line) {
            return Err(OutputError::Capacity(format!(
                "ancillary line {line} already occupied"
            )));
        }
        self.lines.push(VancLine { line, words });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[VancLine] {
        &self.lines
    }
}

/// Rendered ancillary region attached to an output frame. Line `n` packs at
/// byte offset `(n - first_line) * row_bytes`.
#[derive(Debug, Clone)]
pub struct AncillaryData {
    pub first_line: u32,
    pub row_bytes: usize,
    pub data: Vec<u8>,
}

impl AncillaryData {
    pub fn line_bytes(&self, line: u32) -> Option<&[u8]> {
        if line < self.first_line {
            return None;
        }
        let off = (line - self.first_line) as usize * self.row_bytes;
        self.data.get(off..off + self.row_bytes)
    }
}

/// Render every accepted line with the wire packing rule: words fill the
/// luma channel, chroma positions hold the neutral code.
pub fn render(set: &VancLineSet, width: u32) -> Result<Option<AncillaryData>> {
    let Some(first) = set.lines().iter().map(|l| l.line).min() else {
        return Ok(None);
    };
    let last = set.lines().iter().map(|l| l.line).max().unwrap_or(first);
    let rows = (last - first + 1) as usize;
    let stride = pack::row_bytes(width);

    let mut data = Vec::new();
    data.try_reserve_exact(stride * rows)
        .map_err(|e| OutputError::ResourceExhaustion(format!("ancillary region: {e}")))?;
    data.resize(stride * rows, 0);

    let luma_capacity = width as usize;
    for l in set.lines() {
        let mut words = &l.words[..];
        if words.len() > luma_capacity {
            warn!(
                line = l.line,
                len = words.len(),
                capacity = luma_capacity,
                "ancillary words exceed line capacity, truncating"
            );
            metrics::counter!("vanc_lines_truncated").increment(1);
            words = &words[..luma_capacity];
        }
        let mut samples = vec![CHROMA_NEUTRAL; luma_capacity * 2];
        for i in 0..luma_capacity {
            samples[i * 2 + 1] = LUMA_BLACK;
        }
        for (k, &w) in words.iter().enumerate() {
            samples[k * 2 + 1] = w;
        }
        let off = (l.line - first) as usize * stride;
        pack::pack_words(&samples, &mut data[off..off + stride]);
    }

    Ok(Some(AncillaryData {
        first_line: first,
        row_bytes: stride,
        data,
    }))
}

/// Stateful encoder turning a unit's side data into its ancillary region.
/// One per scheduler; owns the caption sequence counter.
pub struct AncillaryEncoder {
    cdp: CdpEncoder,
    width: u32,
    height: u32,
}

impl AncillaryEncoder {
    pub fn new(video: &VideoConfig) -> Result<Self> {
        Ok(Self {
            cdp: CdpEncoder::new(video.time_base)?,
            width: video.width,
            height: video.height,
        })
    }

    /// Encode caption and format-description blobs into rendered lines.
    /// Collisions are fail-soft: the offending unit is dropped and logged,
    /// prior units and the frame still ship.
    pub fn encode(&mut self, side_data: &[SideData]) -> Result<Option<AncillaryData>> {
        let mut set = VancLineSet::new();
        for sd in side_data {
            let (line, words) = match sd {
                SideData::Captions(data) => (
                    CAPTION_LINE,
                    packet_words(DID_CAPTIONS, SDID_CAPTIONS, &self.cdp.encode(data)),
                ),
                SideData::FormatDescription(data) if !data.is_empty() => {
                    let afd =
                        AfdPacket::new(data[0], aspect_for_resolution(self.width, self.height));
                    (AFD_LINE, packet_words(DID_AFD, SDID_AFD, &afd.payload()))
                }
                _ => continue,
            };
            if let Err(e) = set.insert(line, words) {
                warn!(error = %e, "dropping ancillary unit");
                metrics::counter!("vanc_units_rejected").increment(1);
            }
        }
        render(&set, self.width)
    }
}
