//! YOLOに関する画像処理モジュール

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Pixel, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use ndarray::Array4;
use rusttype::{Font, Scale};

use crate::detection_result::DetectionData;
use crate::error::YoloError;

/// パディングの色
const PAD_COLOR: Rgb<u8> = Rgb([127, 127, 127]);

/// 縦横比を保ったままリサイズし、灰色で中央にパディングした正方形の画像を生成します。
///
/// # Args
///
/// * `img` - リサイズする画像
/// * `size` - リサイズ後の画像のサイズ
///
/// # Return
///
/// * リサイズ、パディングを行ったRGB画像
pub fn letterbox_img(img: &DynamicImage, size: u32) -> RgbImage {
    let resized = img.resize(size, size, FilterType::Triangle).to_rgb8();

    let pad_w = (size - resized.width()) / 2;
    let pad_h = (size - resized.height()) / 2;

    let mut new_img = RgbImage::from_pixel(size, size, PAD_COLOR);
    imageops::replace(&mut new_img, &resized, pad_w as i64, pad_h as i64);
    new_img
}

/// RGB画像を (1, height, width, 3)、値が [0, 1] の入力テンソルに変換します。
pub fn to_input_tensor(img: &RgbImage) -> Array4<f32> {
    let (w, h) = img.dimensions();
    Array4::from_shape_fn((1, h as usize, w as usize, 3), |(_, y, x, c)| {
        img.get_pixel(x as u32, y as u32)[c] as f32 / 255.
    })
}

/// TrueTypeフォントを読み込みます。
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<Font<'static>> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| YoloError::resource(path, e))?;
    Font::try_from_vec(data).with_context(|| format!("`{}` is not a valid font", path.display()))
}

const COLORS: [[u8; 3]; 10] = [
    [255, 0, 0],
    [255, 255, 0],
    [0, 0, 255],
    [14, 23, 50],
    [28, 105, 80],
    [190, 159, 53],
    [46, 194, 148],
    [242, 30, 131],
    [97, 101, 198],
    [115, 11, 87],
];

/// 画像上に線を描画します。
///
/// # Args
///
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    let (bx, by) = (x1 - (thickness / 2.).floor(), y1 - (thickness / 2.).floor());

    let (w, h) = if x1 == x2 {
        (thickness, (y2 - y1).abs() + thickness)
    } else {
        ((x2 - x1).abs() + thickness, thickness)
    };

    let rect = Rect::at(bx as i32, by as i32).of_size(w.max(1.) as u32, h.max(1.) as u32);
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上に矩形を描画します。
fn draw_rect(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    draw_line(img, x1, y1, x1, y2, thickness, color);
    draw_line(img, x1, y2, x2, y2, thickness, color);
    draw_line(img, x1, y1, x2, y1, thickness, color);
    draw_line(img, x2, y1, x2, y2, thickness, color);
}

/// 画像上にラベルを描画します。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `x1`, `y1` - ラベルの左下の座標
/// * `line_thickness` - バウンディングボックスの線の太さ
/// * `bg_color` - ラベルの背景色
/// * `font` - ラベルのフォント
/// * `font_size` - ラベルのフォントサイズ
/// * `text` - ラベルに表示するテキスト
#[allow(clippy::too_many_arguments)]
fn draw_label(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    line_thickness: f32,
    bg_color: Rgb<u8>,
    font: &Font,
    font_size: f32,
    text: &str,
) {
    let label_h = font_size;
    let dx1 = x1 - (line_thickness / 2.).floor();
    // 画像の上端にかかる場合はボックスの内側に描く
    let label_y = if y1 - label_h < 0. { y1 } else { y1 - label_h };

    let pad = 6.;
    let scale = Scale::uniform(label_h);
    let (text_w, _) = text_size(scale, font, text);
    let v_metrics = font.v_metrics(scale);
    let text_h = v_metrics.ascent - v_metrics.descent + v_metrics.line_gap;

    let rect = Rect::at(dx1 as i32, label_y as i32).of_size((text_w as f32 + pad * 2.) as u32, label_h as u32);
    draw_filled_rect_mut(img, rect, bg_color);

    let text_y = label_y + (label_h - text_h) / 2.;

    let text_color = if (bg_color[0] as i32 + bg_color[1] as i32 + bg_color[2] as i32) < 382 {
        Rgb([255u8, 255, 255])
    } else {
        Rgb([0u8, 0, 0])
    };
    draw_text_mut(img, text_color, (dx1 + pad) as i32, text_y as i32, scale, font, text);
}

/// 画像上にバウンディングボックスとラベルを描画します。
///
/// # Args
///
/// * `img` - バウンディングボックスとラベルを描画する画像 (in-place)
/// * `d_result` - 元の画像全体を 1 とした正規化座標の検出結果
/// * `names` - クラス名。足りない場合はクラスIDを表示します
/// * `font` - ラベルのフォント
/// * `font_size` - ラベルのフォントサイズ
/// * `line_thickness` - バウンディングボックスの線の太さ
pub fn draw_bbox(
    img: &mut RgbImage,
    d_result: &[DetectionData],
    names: &[String],
    font: &Font,
    font_size: f32,
    line_thickness: f32,
) {
    let (width, height) = img.dimensions();
    let mut sorted = d_result.to_vec();
    sorted.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    for d in sorted.iter() {
        let color = *Rgb::from_slice(&COLORS[d.class % COLORS.len()]);

        let (x1, y1, x2, y2) = d.pixel_corners(width, height);
        let (x1, y1, x2, y2) = (x1.round(), y1.round(), x2.round(), y2.round());

        draw_rect(img, x1, y1, x2, y2, line_thickness, color);

        let text = match names.get(d.class) {
            Some(name) => format!("{}: {:.2}", name, d.confidence),
            None => format!("{}: {:.2}", d.class, d.confidence),
        };
        draw_label(img, x1, y1, line_thickness, color, font, font_size, &text);
    }
}
