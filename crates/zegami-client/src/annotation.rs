// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Annotation records and the 1-bit mask annotation codec.

use crate::Error;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Annotation type of single channel 1-bit masks.
pub const MASK_TYPE: &str = "mask_1UC1";
/// Format label sent with mask annotations.
pub const MASK_FORMAT: &str = "1UC1";

/// Annotation data ready to be attached to an image with
/// [`Collection::upload_annotation`](crate::Collection::upload_annotation).
#[derive(Debug, Clone, PartialEq)]
pub struct Uploadable {
    kind: String,
    format: String,
    class_id: i64,
    annotation: Value,
}

impl Uploadable {
    pub fn new(kind: &str, format: &str, class_id: i64, annotation: Value) -> Self {
        Uploadable {
            kind: kind.to_string(),
            format: format.to_string(),
            class_id,
            annotation,
        }
    }

    /// Mask annotation of the given class.
    pub fn from_mask(mask: &Mask, class_id: i64) -> Self {
        Self::new(MASK_TYPE, MASK_FORMAT, class_id, mask.encode())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn class_id(&self) -> i64 {
        self.class_id
    }

    pub fn annotation(&self) -> &Value {
        &self.annotation
    }

    /// Assembles the upload payload for one image.
    ///
    /// Every string field must be non-empty and the annotation body must
    /// not be null or an empty object.
    pub(crate) fn payload(
        &self,
        imageset_id: &str,
        image_index: usize,
        author: &str,
    ) -> Result<Value, Error> {
        let empty = [
            ("type", self.kind.is_empty()),
            ("format", self.format.is_empty()),
            ("imageset_id", imageset_id.is_empty()),
            ("author", author.is_empty()),
            (
                "annotation",
                match &self.annotation {
                    Value::Null => true,
                    Value::Object(map) => map.is_empty(),
                    Value::String(s) => s.is_empty(),
                    _ => false,
                },
            ),
        ];

        if let Some((field, _)) = empty.iter().find(|(_, is_empty)| *is_empty) {
            return Err(Error::InvalidParameters(format!(
                "annotation field '{}' is empty",
                field
            )));
        }

        Ok(json!({
            "imageset_id": imageset_id,
            "image_index": image_index,
            "author": author,
            "class_id": self.class_id,
            "type": self.kind,
            "format": self.format,
            "annotation": self.annotation,
        }))
    }
}

/// An annotation stored on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    id: String,
    #[serde(default)]
    imageset_id: String,
    #[serde(default)]
    image_index: usize,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    class_id: Option<i64>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    annotation: Value,
}

impl Annotation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn imageset_id(&self) -> &str {
        &self.imageset_id
    }

    pub fn image_index(&self) -> usize {
        self.image_index
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn class_id(&self) -> Option<i64> {
        self.class_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn body(&self) -> &Value {
        &self.annotation
    }

    /// Decodes the body of a mask annotation.
    pub fn mask(&self) -> Result<Mask, Error> {
        if self.kind != MASK_TYPE {
            return Err(Error::UnsupportedFormat(format!(
                "annotation {} is of type {}, not {}",
                self.id, self.kind, MASK_TYPE
            )));
        }
        Mask::decode(&self.annotation)
    }
}

/// Parses an annotation listing, either a bare list or `{"annotations": [..]}`.
pub(crate) fn parse_annotations(value: Value) -> Result<Vec<Annotation>, Error> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map.remove("annotations").ok_or(Error::InvalidResponse)?,
        _ => return Err(Error::InvalidResponse),
    };
    Ok(serde_json::from_value(list)?)
}

/// Boolean raster, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl Mask {
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Result<Self, Error> {
        if data.len() != width as usize * height as usize {
            return Err(Error::InvalidParameters(format!(
                "mask of {}x{} needs {} values, got {}",
                width,
                height,
                width as usize * height as usize,
                data.len()
            )));
        }
        Ok(Mask {
            width,
            height,
            data,
        })
    }

    /// Thresholds the first channel of an image: values above 127 are set.
    /// Grayscale images expand to equal channels, so their single channel is
    /// used as is.
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        Mask {
            width: rgba.width(),
            height: rgba.height(),
            data: rgba.pixels().map(|p| p.0[0] > 127).collect(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> Option<bool> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    fn stride(width: u32) -> usize {
        (width as usize).div_ceil(8)
    }

    /// Packs the mask one bit per pixel, most significant bit first, each
    /// row padded to a whole byte.
    pub fn to_bits(&self) -> Vec<u8> {
        let stride = Self::stride(self.width);
        let mut bits = vec![0u8; stride * self.height as usize];
        for (i, set) in self.data.iter().enumerate() {
            if *set {
                let x = i % self.width as usize;
                let y = i / self.width as usize;
                bits[y * stride + x / 8] |= 0x80 >> (x % 8);
            }
        }
        bits
    }

    pub fn from_bits(width: u32, height: u32, bits: &[u8]) -> Result<Self, Error> {
        let stride = Self::stride(width);
        if bits.len() < stride * height as usize {
            return Err(Error::MalformedRecord(format!(
                "mask of {}x{} needs {} bytes, got {}",
                width,
                height,
                stride * height as usize,
                bits.len()
            )));
        }

        let data = (0..height as usize)
            .flat_map(|y| {
                (0..width as usize).map(move |x| bits[y * stride + x / 8] & (0x80 >> (x % 8)) != 0)
            })
            .collect();
        Ok(Mask {
            width,
            height,
            data,
        })
    }

    /// `{"data": base64, "width": w, "height": h}`
    pub fn encode(&self) -> Value {
        json!({
            "data": STANDARD.encode(self.to_bits()),
            "width": self.width,
            "height": self.height,
        })
    }

    /// Decodes [`encode`][Self::encode] output. A full annotation record
    /// holding the body under `annotation` is accepted too.
    pub fn decode(value: &Value) -> Result<Self, Error> {
        let body = value.get("annotation").unwrap_or(value);
        let field = |name: &str| {
            body.get(name)
                .ok_or_else(|| Error::MalformedRecord(format!("mask has no '{}'", name)))
        };

        let data = field("data")?
            .as_str()
            .ok_or_else(|| Error::MalformedRecord("mask data is not a string".to_string()))?;
        let dimension = |name: &str| -> Result<u32, Error> {
            field(name)?
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Error::MalformedRecord(format!("mask {} is invalid", name)))
        };
        let width = dimension("width")?;
        let height = dimension("height")?;

        let bits = STANDARD
            .decode(data)
            .map_err(|e| Error::MalformedRecord(format!("mask data is not base64: {}", e)))?;
        Self::from_bits(width, height, &bits)
    }

    /// 8-bit image with set pixels at 255.
    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y).unwrap_or(false) { 255 } else { 0 }])
        })
    }
}
