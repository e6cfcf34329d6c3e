//! Media model crossing the pipeline boundary

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of the unit handed to the output: either the packed 10-bit wire
/// format, or a native 8-bit picture the device consumes as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceCodec {
    PackedWire,
    WrappedNative,
}

/// Planar pixel layouts accepted from upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PictureFormat {
    Yuv422p10,
    Yuv422p,
    Yuv420p,
    Uyvy422,
}

/// Sample storage for one picture - 8-bit planes are byte buffers, 10-bit
/// planes carry one 16-bit container word per sample.
#[derive(Clone)]
pub enum PictureData {
    Planes8(Vec<Bytes>),
    Planes10(Vec<Arc<[u16]>>),
}

/// Picture metadata
#[derive(Debug, Clone)]
pub struct PictureMeta {
    pub width: u32,
    pub height: u32,
    pub format: PictureFormat,
    pub interlaced: bool,
    pub pts: i64,
}

/// One video unit from the upstream pipeline.
///
/// Immutable once handed to the scheduler; planes are shared, not copied.
#[derive(Clone)]
pub struct Picture {
    pub meta: PictureMeta,
    pub data: PictureData,
    pub side_data: Vec<SideData>,
}

/// Tagged metadata blobs attached to a unit. Caption and format-description
/// blobs are decoded into ancillary words at output time; every other tag is
/// copied through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideData {
    /// CEA-708 byte triplets (type, code0, code1)
    Captions(Bytes),
    /// Active format description control byte
    FormatDescription(Bytes),
    BarData(Bytes),
    PipelineStats(Bytes),
    Unregistered(Bytes),
}

/// Wire-format unit produced by the packer. Side data rides along verbatim.
#[derive(Clone)]
pub struct PackedUnit {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    pub side_data: Vec<SideData>,
}
