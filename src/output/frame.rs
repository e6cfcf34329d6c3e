//! Reference-counted frame handle bridging the pipeline and the device.

use bytes::Bytes;

use crate::error::{OutputError, Result};
use crate::frame::{PackedUnit, Picture, PictureData, PictureFormat};
use crate::pack;
use crate::vanc::AncillaryData;

/// Pixel-format tag the device sees on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Packed10,
    Native8,
}

/// One scheduled frame: payload plus optional ancillary region.
///
/// Handed around as `Arc<OutputFrame>`: the scheduler holds the first
/// reference, the device clone is the second. The payload drops exactly once,
/// when the last reference goes - on device completion or on submission
/// failure. Immutable once scheduled.
pub struct OutputFrame {
    data: Bytes,
    format: WireFormat,
    width: u32,
    height: u32,
    ancillary: Option<AncillaryData>,
}

impl OutputFrame {
    /// Wrap a packed wire unit and its rendered ancillary region.
    pub fn from_packed(unit: PackedUnit, ancillary: Option<AncillaryData>) -> Self {
        Self {
            data: unit.data,
            format: WireFormat::Packed10,
            width: unit.width,
            height: unit.height,
            ancillary,
        }
    }

    /// Wrap a native 8-bit picture as-is. The plane reference is shared, not
    /// copied.
    pub fn from_wrapped(pic: &Picture) -> Result<Self> {
        match (&pic.data, pic.meta.format) {
            (PictureData::Planes8(planes), PictureFormat::Uyvy422) if planes.len() == 1 => {
                Ok(Self {
                    data: planes[0].clone(),
                    format: WireFormat::Native8,
                    width: pic.meta.width,
                    height: pic.meta.height,
                    ancillary: None,
                })
            }
            _ => Err(OutputError::Precondition(
                "wrapped output takes a single-plane native picture".into(),
            )),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> WireFormat {
        self.format
    }

    /// Bytes per row in the device's layout for this format.
    pub fn row_bytes(&self) -> usize {
        match self.format {
            WireFormat::Packed10 => pack::row_bytes(self.width),
            WireFormat::Native8 => self.width as usize * 2,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn ancillary(&self) -> Option<&AncillaryData> {
        self.ancillary.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PictureMeta;
    use std::sync::Arc;

    fn packed_unit() -> PackedUnit {
        PackedUnit {
            data: Bytes::from(vec![0u8; 128]),
            width: 48,
            height: 1,
            pts: 0,
            side_data: vec![],
        }
    }

    #[test]
    fn handle_is_shared_then_dropped_once() {
        let frame = Arc::new(OutputFrame::from_packed(packed_unit(), None));
        assert_eq!(Arc::strong_count(&frame), 1);
        let device_ref = Arc::clone(&frame);
        assert_eq!(Arc::strong_count(&frame), 2);
        drop(device_ref);
        assert_eq!(Arc::strong_count(&frame), 1);
    }

    #[test]
    fn row_bytes_tracks_the_wire_format() {
        let packed = OutputFrame::from_packed(packed_unit(), None);
        assert_eq!(packed.row_bytes(), 128);

        let pic = Picture {
            meta: PictureMeta {
                width: 48,
                height: 2,
                format: PictureFormat::Uyvy422,
                interlaced: false,
                pts: 0,
            },
            data: PictureData::Planes8(vec![Bytes::from(vec![0u8; 48 * 2 * 2])]),
            side_data: vec![],
        };
        let wrapped = OutputFrame::from_wrapped(&pic).unwrap();
        assert_eq!(wrapped.row_bytes(), 96);
        assert_eq!(wrapped.pixel_format(), WireFormat::Native8);
    }

    #[test]
    fn wrapped_rejects_planar_input() {
        let pic = Picture {
            meta: PictureMeta {
                width: 48,
                height: 2,
                format: PictureFormat::Yuv422p,
                interlaced: false,
                pts: 0,
            },
            data: PictureData::Planes8(vec![
                Bytes::from(vec![0u8; 96]),
                Bytes::from(vec![0u8; 48]),
                Bytes::from(vec![0u8; 48]),
            ]),
            side_data: vec![],
        };
        assert!(matches!(
            OutputFrame::from_wrapped(&pic),
            Err(OutputError::Precondition(_))
        ));
    }
}
