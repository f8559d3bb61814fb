//! 内容规范化 (Canonicalization)
//!
//! 把抓取到的原始字节变成稳定的表示：同一页面抓两次、或只做了排版/空白/标记层面修改的拷贝，
//! 规范化之后应当逐字节一致。纯函数，无 I/O。

use encoding_rs::{Encoding, UTF_8};
use scraper::{Html, Node};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::Cursor;

use crate::error::CanonicalizationError;

/// 内容类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Html,
    Text,
    Image,
    Unknown,
}

impl ContentKind {
    /// 先看 Content-Type，缺失或无法识别时再嗅探字节
    pub fn classify(content_type: Option<&str>, body: &[u8]) -> Self {
        if let Some(essence) = content_type.map(mime_essence) {
            match essence.as_str() {
                "text/html" | "application/xhtml+xml" => return Self::Html,
                "application/json" | "application/xml" | "text/xml" => return Self::Text,
                e if e.starts_with("text/") => return Self::Text,
                e if e.starts_with("image/") => return Self::Image,
                _ => {}
            }
        }
        Self::sniff(body)
    }

    fn sniff(body: &[u8]) -> Self {
        const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
        const JPEG: &[u8] = b"\xff\xd8\xff";
        const GIF: &[u8] = b"GIF8";
        const BMP: &[u8] = b"BM";

        if body.starts_with(PNG)
            || body.starts_with(JPEG)
            || body.starts_with(GIF)
            || body.starts_with(BMP)
            || (body.len() >= 12 && &body[0..4] == b"RIFF" && &body[8..12] == b"WEBP")
        {
            return Self::Image;
        }

        match std::str::from_utf8(strip_bom(body)) {
            Ok(text) => {
                let head: String = text.trim_start().chars().take(512).collect::<String>().to_ascii_lowercase();
                if head.starts_with("<!doctype html") || head.contains("<html") || head.contains("<body") {
                    Self::Html
                } else {
                    Self::Text
                }
            }
            Err(_) => Self::Unknown,
        }
    }
}

/// 规范化后的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalContent {
    pub kind: ContentKind,
    /// 文本：空格分隔的 token；图片：`宽(u32 BE) ‖ 高(u32 BE) ‖ RGBA8 像素`
    pub bytes: Vec<u8>,
}

impl CanonicalContent {
    /// 文本类内容的 token 序列；图片返回空
    pub fn tokens(&self) -> Vec<&str> {
        if self.kind == ContentKind::Image {
            return Vec::new();
        }
        std::str::from_utf8(&self.bytes)
            .map(|text| text.split(' ').filter(|t| !t.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// 图片像素上限的默认值 (约 40MP，RGBA8 解码后 160MB)
pub const DEFAULT_MAX_IMAGE_PIXELS: u64 = 40_000_000;

/// 入口：原始字节 + 类别 -> 规范字节
pub fn canonicalize(
    bytes: &[u8],
    kind: ContentKind,
    content_type: Option<&str>,
) -> Result<CanonicalContent, CanonicalizationError> {
    canonicalize_with_budget(bytes, kind, content_type, DEFAULT_MAX_IMAGE_PIXELS)
}

/// 同 `canonicalize`，图片先读头部尺寸，宽×高超过 `max_image_pixels` 直接拒绝，不做解码
pub fn canonicalize_with_budget(
    bytes: &[u8],
    kind: ContentKind,
    content_type: Option<&str>,
    max_image_pixels: u64,
) -> Result<CanonicalContent, CanonicalizationError> {
    match kind {
        ContentKind::Html => {
            let text = decode_text(bytes, content_type, true)?;
            let visible = visible_text(&text);
            canonical_text(&visible, ContentKind::Html)
        }
        ContentKind::Text => {
            let text = decode_text(bytes, content_type, false)?;
            canonical_text(&text, ContentKind::Text)
        }
        ContentKind::Image => canonical_image(bytes, max_image_pixels),
        ContentKind::Unknown => Err(CanonicalizationError::UnsupportedContentType(
            content_type.unwrap_or("unknown").to_string(),
        )),
    }
}

// ==========================================
// 文本
// ==========================================

/// 不可见或与正文无关的子树
const HIDDEN_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "svg", "iframe", "object",
];

/// 编码优先级：BOM > Content-Type charset > `<meta charset>` (仅 HTML) > UTF-8。
/// 不认识的标签按 UTF-8 处理；只有字节在所选编码下确实非法才算 `Undecodable`。
fn decode_text<'a>(
    bytes: &'a [u8],
    content_type: Option<&str>,
    is_html: bool,
) -> Result<Cow<'a, str>, CanonicalizationError> {
    let (encoding, body) = match Encoding::for_bom(bytes) {
        Some((encoding, bom_len)) => (encoding, &bytes[bom_len..]),
        None => {
            let label = content_type
                .and_then(declared_charset)
                .or_else(|| if is_html { meta_charset(bytes) } else { None });
            let encoding = label
                .and_then(|l| Encoding::for_label(l.as_bytes()))
                .unwrap_or(UTF_8);
            (encoding, bytes)
        }
    };

    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or_else(|| CanonicalizationError::Undecodable {
            expected: encoding.name().to_string(),
            detail: "byte sequence is malformed for this encoding".to_string(),
        })
}

/// 在文档开头 1024 字节里找 `charset=`，覆盖 `<meta charset>` 和 http-equiv 两种写法
fn meta_charset(bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]).to_ascii_lowercase();
    let start = head.find("<meta")?;
    let rest = &head[start..];
    let pos = rest.find("charset=")? + "charset=".len();
    let label: String = rest[pos..]
        .trim_start_matches(['"', '\'', ' '])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        .collect();
    (!label.is_empty()).then_some(label)
}

/// 只保留可见文本节点；属性 (含随机 DOM id) 自然被丢弃
fn visible_text(markup: &str) -> String {
    let document = Html::parse_document(markup);
    let mut out = String::with_capacity(markup.len() / 2);
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| match ancestor.value() {
            Node::Element(el) => HIDDEN_TAGS.contains(&el.name()),
            _ => false,
        });
        if hidden {
            continue;
        }
        out.push(' ');
        out.push_str(text);
    }
    out
}

fn canonical_text(text: &str, kind: ContentKind) -> Result<CanonicalContent, CanonicalizationError> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Err(CanonicalizationError::Empty);
    }
    Ok(CanonicalContent {
        kind,
        bytes: tokens.join(" ").into_bytes(),
    })
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if is_cjk(ch) {
            // 中日韩文字没有空格分词，逐字成 token
            flush(&mut current, &mut tokens);
            tokens.push(ch.to_string());
        } else if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else {
            flush(&mut current, &mut tokens);
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

fn flush(current: &mut String, tokens: &mut Vec<String>) {
    if current.is_empty() {
        return;
    }
    let token = std::mem::take(current);
    if !is_volatile(&token) {
        tokens.push(token);
    }
}

/// 易变 token：纯数字 (时间戳、计数器、日期片段) 与长的字母数字混合串 (会话令牌、哈希)
fn is_volatile(token: &str) -> bool {
    let digits = token.chars().filter(|c| c.is_numeric()).count();
    let total = token.chars().count();
    if digits == total {
        return true;
    }
    total >= 8 && digits >= 2
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF      // 平假名 / 片假名
        | 0x3400..=0x4DBF    // CJK 扩展 A
        | 0x4E00..=0x9FFF    // CJK 统一表意文字
        | 0xAC00..=0xD7AF    // 韩文音节
        | 0xF900..=0xFAFF    // CJK 兼容表意文字
        | 0x20000..=0x2A6DF) // CJK 扩展 B
}

// ==========================================
// 图片
// ==========================================

fn image_reader(bytes: &[u8]) -> Result<image::io::Reader<Cursor<&[u8]>>, CanonicalizationError> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CanonicalizationError::Image(e.to_string()))
}

fn canonical_image(bytes: &[u8], max_pixels: u64) -> Result<CanonicalContent, CanonicalizationError> {
    let (width, height) = image_reader(bytes)?
        .into_dimensions()
        .map_err(|e| CanonicalizationError::Image(e.to_string()))?;
    let pixels = u64::from(width) * u64::from(height);
    if pixels > max_pixels {
        return Err(CanonicalizationError::Image(format!(
            "{width}x{height} exceeds the pixel budget of {max_pixels}"
        )));
    }

    let img = image_reader(bytes)?
        .decode()
        .map_err(|e| CanonicalizationError::Image(e.to_string()))?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(CanonicalizationError::Empty);
    }
    let pixels = rgba.into_raw();

    let mut out = Vec::with_capacity(8 + pixels.len());
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&pixels);
    Ok(CanonicalContent {
        kind: ContentKind::Image,
        bytes: out,
    })
}

// ==========================================
// 辅助
// ==========================================

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn declared_charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}
