// 该文件是 RVM （Robora 视觉模块） 项目的一部分。
// src/model/codes.rs - 二维码与条码识别
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::RgbImage;
use rxing::{BarcodeFormat, Exceptions};
use tracing::{debug, warn};

use super::{FailurePolicy, Model, ModelError};
use crate::types::{Code, CodeKind, Point};

/// 解码器给出的原始符号
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSymbol {
  /// 载荷字节，[`CodeReader`] 只保留合法 UTF-8 的载荷
  pub payload: Vec<u8>,
  /// 码制名称，如 `QR_CODE`
  pub symbology: String,
  pub corners: Vec<Point>,
}

/// 条码解码后端
pub trait SymbolDecoder {
  fn decode(&self, image: &RgbImage) -> Result<Vec<DecodedSymbol>, ModelError>;
}

/// 基于 rxing 的多符号解码器
///
/// rxing 已按符号声明的字符集把载荷解码为文本，这里给出的载荷总是 UTF-8；
/// 非 UTF-8 载荷只会来自其他 [`SymbolDecoder`] 实现。
#[derive(Debug, Default, Clone, Copy)]
pub struct RxingDecoder;

impl SymbolDecoder for RxingDecoder {
  fn decode(&self, image: &RgbImage) -> Result<Vec<DecodedSymbol>, ModelError> {
    let luma = image::imageops::grayscale(image);
    let (width, height) = luma.dimensions();

    let results = match rxing::helpers::detect_multiple_in_luma(luma.into_raw(), width, height) {
      Ok(results) => results,
      Err(
        Exceptions::NotFoundException(_)
        | Exceptions::FormatException(_)
        | Exceptions::ChecksumException(_),
      ) => return Ok(Vec::new()),
      Err(e) => return Err(ModelError::Inference(format!("条码解码失败: {}", e))),
    };

    Ok(
      results
        .iter()
        .map(|r| DecodedSymbol {
          payload: r.getText().as_bytes().to_vec(),
          symbology: symbology_name(r.getBarcodeFormat()),
          corners: r
            .getPoints()
            .iter()
            .map(|p| Point::new(p.x.round() as i32, p.y.round() as i32))
            .collect(),
        })
        .collect(),
    )
  }
}

fn symbology_name(format: &BarcodeFormat) -> String {
  format!("{:?}", format)
}

/// 二维码码制
fn is_qr_symbology(symbology: &str) -> bool {
  matches!(
    symbology,
    "QR_CODE" | "MICRO_QR_CODE" | "RECTANGULAR_MICRO_QR_CODE"
  )
}

/// 按码制分类后的识别结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeDetections {
  pub qr_codes: Vec<Code>,
  pub barcodes: Vec<Code>,
}

impl CodeDetections {
  pub fn is_empty(&self) -> bool {
    self.qr_codes.is_empty() && self.barcodes.is_empty()
  }
}

pub struct CodeReader {
  decoder: Box<dyn SymbolDecoder>,
  policy: FailurePolicy,
}

impl Default for CodeReader {
  fn default() -> Self {
    Self::new(RxingDecoder)
  }
}

impl CodeReader {
  pub fn new(decoder: impl SymbolDecoder + 'static) -> Self {
    Self {
      decoder: Box::new(decoder),
      policy: FailurePolicy::Propagate,
    }
  }

  pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.policy = policy;
    self
  }

  fn read(&self, image: &RgbImage) -> Result<CodeDetections, ModelError> {
    let mut detections = CodeDetections::default();

    for symbol in self.decoder.decode(image)? {
      let data = match String::from_utf8(symbol.payload) {
        Ok(data) => data,
        Err(_) => {
          debug!("丢弃非 UTF-8 载荷 ({})", symbol.symbology);
          continue;
        }
      };
      let qr = is_qr_symbology(&symbol.symbology);
      let code = Code {
        kind: if qr { CodeKind::Qr } else { CodeKind::Barcode },
        data,
        corners: symbol.corners,
        symbology: symbol.symbology,
      };
      if qr {
        detections.qr_codes.push(code);
      } else {
        detections.barcodes.push(code);
      }
    }

    debug!(
      "识别到 {} 个二维码, {} 个条码",
      detections.qr_codes.len(),
      detections.barcodes.len()
    );
    Ok(detections)
  }
}

impl Model for CodeReader {
  type Input = RgbImage;
  type Output = CodeDetections;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    match self.read(input) {
      Ok(detections) => Ok(detections),
      Err(e) if self.policy == FailurePolicy::Fallback => {
        warn!("条码识别失败，返回空结果: {}", e);
        Ok(CodeDetections::default())
      }
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FixedDecoder(Vec<DecodedSymbol>);

  impl SymbolDecoder for FixedDecoder {
    fn decode(&self, _image: &RgbImage) -> Result<Vec<DecodedSymbol>, ModelError> {
      Ok(self.0.clone())
    }
  }

  struct FailingDecoder;

  impl SymbolDecoder for FailingDecoder {
    fn decode(&self, _image: &RgbImage) -> Result<Vec<DecodedSymbol>, ModelError> {
      Err(ModelError::Inference("解码器不可用".to_string()))
    }
  }

  fn symbol(payload: &[u8], symbology: &str) -> DecodedSymbol {
    DecodedSymbol {
      payload: payload.to_vec(),
      symbology: symbology.to_string(),
      corners: vec![Point::new(1, 1), Point::new(9, 1), Point::new(9, 9)],
    }
  }

  #[test]
  fn partitions_by_symbology_and_drops_bad_utf8() {
    let reader = CodeReader::new(FixedDecoder(vec![
      symbol(b"https://robora.example", "QR_CODE"),
      symbol(b"4006381333931", "EAN_13"),
      symbol(&[0xff, 0xfe, 0x00], "CODE_128"),
    ]));
    let found = reader.infer(&RgbImage::new(16, 16)).unwrap();
    assert_eq!(found.qr_codes.len(), 1);
    assert_eq!(found.qr_codes[0].kind, CodeKind::Qr);
    assert_eq!(found.qr_codes[0].data, "https://robora.example");
    assert_eq!(found.barcodes.len(), 1);
    assert_eq!(found.barcodes[0].symbology, "EAN_13");
    assert_eq!(found.barcodes[0].kind, CodeKind::Barcode);
  }

  #[test]
  fn decoder_errors_follow_policy() {
    let strict = CodeReader::new(FailingDecoder);
    assert!(strict.infer(&RgbImage::new(8, 8)).is_err());
    let lenient = CodeReader::new(FailingDecoder).failure_policy(FailurePolicy::Fallback);
    assert!(lenient.infer(&RgbImage::new(8, 8)).unwrap().is_empty());
  }

  /// 把 rxing 生成的符号画到白底画布上
  fn render_symbol(data: &str, format: BarcodeFormat, width: i32, height: i32) -> RgbImage {
    use rxing::{MultiFormatWriter, Writer};

    let matrix = MultiFormatWriter::default()
      .encode(data, &format, width, height)
      .unwrap();
    let margin = 40;
    let mut canvas = RgbImage::from_pixel(
      matrix.getWidth() + 2 * margin,
      matrix.getHeight() + 2 * margin,
      image::Rgb([255, 255, 255]),
    );
    for y in 0..matrix.getHeight() {
      for x in 0..matrix.getWidth() {
        if matrix.get(x, y) {
          canvas.put_pixel(x + margin, y + margin, image::Rgb([0, 0, 0]));
        }
      }
    }
    canvas
  }

  #[test]
  fn rxing_reads_qr_code() {
    let image = render_symbol("hello rvm", BarcodeFormat::QR_CODE, 200, 200);
    let found = CodeReader::default().infer(&image).unwrap();
    assert_eq!(found.qr_codes.len(), 1);
    assert!(found.barcodes.is_empty());
    let qr = &found.qr_codes[0];
    assert_eq!(qr.kind, CodeKind::Qr);
    assert_eq!(qr.data, "hello rvm");
    assert_eq!(qr.symbology, "QR_CODE");
    assert!(qr.corners.len() >= 3);
  }

  #[test]
  fn rxing_reads_ean13_as_barcode() {
    let image = render_symbol("4006381333931", BarcodeFormat::EAN_13, 300, 100);
    let found = CodeReader::default().infer(&image).unwrap();
    assert!(found.qr_codes.is_empty());
    assert_eq!(found.barcodes.len(), 1);
    assert_eq!(found.barcodes[0].kind, CodeKind::Barcode);
    assert_eq!(found.barcodes[0].data, "4006381333931");
    assert_eq!(found.barcodes[0].symbology, "EAN_13");
  }

  #[test]
  fn black_image_has_no_codes() {
    let found = CodeReader::default().infer(&RgbImage::new(256, 256)).unwrap();
    assert!(found.is_empty());
  }
}
