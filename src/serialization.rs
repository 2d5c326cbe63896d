//! Line-oriented tagged model format.
//!
//! Every field is a block:
//!
//! ```text
//! ∫name∫
//! content lines…
//! ∂name∂
//! ```
//!
//! Scalars are plain decimal text (doubles with 6 fractional digits),
//! composite values are base64 blobs, and an absent value is the single
//! line [`NULL_SENTINEL`]. End tags match case-insensitively.
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use crate::activations::{Activation, ActivationKind};
use crate::error::{NetError, Result};
use crate::layers::{Dropout, Layer, LayerKind, Pooling, PoolingMode};
use crate::network::Network;
use crate::node::{ComputationNode, ConvGeometry, ConvNode, DenseNode, Node};

pub const BEGIN: char = '∫';
pub const END: char = '∂';
/// Written in place of a whole block when a value is absent.
pub const NULL_SENTINEL: &str = "∅∅";

const FORMAT_VERSION: u64 = 1;
const BLOB_LINE: usize = 76;

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains([BEGIN, END]) || name.contains(char::is_whitespace) {
        return Err(NetError::format(format!("illegal field name {name:?}")));
    }
    Ok(())
}

/// Writes tagged blocks to any byte sink.
pub struct TaggedWriter<W: Write> {
    out: W,
}

impl<W: Write> TaggedWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn block<'a>(&mut self, name: &str, lines: impl IntoIterator<Item = &'a str>) -> Result<()> {
        check_name(name)?;
        writeln!(self.out, "{BEGIN}{name}{BEGIN}")?;
        for line in lines {
            writeln!(self.out, "{line}")?;
        }
        writeln!(self.out, "{END}{name}{END}")?;
        Ok(())
    }

    pub fn write_null(&mut self) -> Result<()> {
        writeln!(self.out, "{NULL_SENTINEL}")?;
        Ok(())
    }

    pub fn write_int(&mut self, name: &str, value: u64) -> Result<()> {
        self.block(name, [value.to_string().as_str()])
    }

    pub fn write_double(&mut self, name: &str, value: f64) -> Result<()> {
        self.block(name, [format!("{value:.6}").as_str()])
    }

    pub fn write_text(&mut self, name: &str, value: &str) -> Result<()> {
        if value.lines().any(|l| l.starts_with([BEGIN, END]) || l == NULL_SENTINEL) {
            return Err(NetError::format(format!("text for {name} contains a tag line")));
        }
        self.block(name, value.lines())
    }

    pub fn write_blob(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let encoded = STANDARD.encode(bytes);
        let lines = encoded
            .as_bytes()
            .chunks(BLOB_LINE)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default());
        self.block(name, lines)
    }
}

/// Reads tagged blocks back in the order they were written.
pub struct TaggedReader<'a> {
    lines: std::str::Lines<'a>,
}

impl<'a> TaggedReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { lines: text.lines() }
    }

    fn next_line(&mut self) -> Option<&'a str> {
        self.lines.by_ref().map(str::trim_end).find(|l| !l.is_empty())
    }

    /// Content lines of the field `name`, or `None` for the null sentinel.
    pub fn read_field(&mut self, name: &str) -> Result<Option<Vec<&'a str>>> {
        let line = self
            .next_line()
            .ok_or_else(|| NetError::format(format!("missing begin tag for {name}")))?;
        if line == NULL_SENTINEL {
            return Ok(None);
        }
        let tag = line
            .strip_prefix(BEGIN)
            .and_then(|l| l.strip_suffix(BEGIN))
            .ok_or_else(|| NetError::format(format!("missing begin tag for {name}, found {line:?}")))?;
        if !tag.eq_ignore_ascii_case(name) {
            return Err(NetError::format(format!("expected field {name}, found {tag}")));
        }
        let mut content = Vec::new();
        for line in self.lines.by_ref() {
            let line = line.trim_end();
            if let Some(end) = line.strip_prefix(END).and_then(|l| l.strip_suffix(END)) {
                if end.eq_ignore_ascii_case(name) {
                    return Ok(Some(content));
                }
                return Err(NetError::format(format!("end tag {end} does not close {name}")));
            }
            content.push(line);
        }
        Err(NetError::format(format!("end tag for {name} never found")))
    }

    fn read_scalar(&mut self, name: &str) -> Result<Option<&'a str>> {
        match self.read_field(name)? {
            None => Ok(None),
            Some(lines) if lines.len() == 1 => Ok(Some(lines[0].trim())),
            Some(lines) => Err(NetError::format(format!(
                "{name} should hold one line, found {}",
                lines.len()
            ))),
        }
    }

    pub fn read_int(&mut self, name: &str) -> Result<Option<u64>> {
        self.read_scalar(name)?
            .map(|s| {
                s.parse()
                    .map_err(|_| NetError::format(format!("{name}: {s:?} is not an integer")))
            })
            .transpose()
    }

    pub fn read_double(&mut self, name: &str) -> Result<Option<f64>> {
        self.read_scalar(name)?
            .map(|s| {
                s.parse()
                    .map_err(|_| NetError::format(format!("{name}: {s:?} is not a number")))
            })
            .transpose()
    }

    pub fn read_text(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.read_field(name)?.map(|lines| lines.join("\n")))
    }

    pub fn read_blob(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_field(name)?
            .map(|lines| {
                STANDARD
                    .decode(lines.concat())
                    .map_err(|e| NetError::format(format!("{name}: invalid base64 ({e})")))
            })
            .transpose()
    }

    fn require<T>(name: &str, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| NetError::format(format!("{name} must not be null")))
    }

    pub fn require_int(&mut self, name: &str) -> Result<u64> {
        let value = self.read_int(name)?;
        Self::require(name, value)
    }

    pub fn require_usize(&mut self, name: &str) -> Result<usize> {
        let value = self.require_int(name)?;
        usize::try_from(value).map_err(|_| NetError::format(format!("{name} does not fit in usize")))
    }

    pub fn require_text(&mut self, name: &str) -> Result<String> {
        let value = self.read_text(name)?;
        Self::require(name, value)
    }

    pub fn require_blob(&mut self, name: &str) -> Result<Vec<u8>> {
        let value = self.read_blob(name)?;
        Self::require(name, value)
    }
}

fn encode_params(node: &Node) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(node.param_count() * 8);
    for &w in node.weights() {
        bytes.write_f64::<LittleEndian>(w)?;
    }
    bytes.write_f64::<LittleEndian>(node.bias())?;
    Ok(bytes)
}

fn decode_params(bytes: &[u8]) -> Result<(Vec<f64>, f64)> {
    if bytes.len() % 8 != 0 || bytes.len() < 16 {
        return Err(NetError::format(format!("parameter blob of {} bytes", bytes.len())));
    }
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::with_capacity(bytes.len() / 8);
    while (cursor.position() as usize) < bytes.len() {
        values.push(cursor.read_f64::<LittleEndian>()?);
    }
    let bias = values.pop().unwrap_or_default();
    Ok((values, bias))
}

fn encode_dropout(dropout: &Dropout) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(16);
    bytes.write_f64::<LittleEndian>(dropout.rate())?;
    bytes.write_u64::<LittleEndian>(dropout.seed())?;
    Ok(bytes)
}

fn decode_dropout(bytes: &[u8]) -> Result<Dropout> {
    if bytes.len() != 16 {
        return Err(NetError::format(format!("dropout blob of {} bytes", bytes.len())));
    }
    let mut cursor = Cursor::new(bytes);
    let rate = cursor.read_f64::<LittleEndian>()?;
    let seed = cursor.read_u64::<LittleEndian>()?;
    Dropout::new(rate, seed).map_err(|e| NetError::format(e.to_string()))
}

fn write_activation<W: Write>(
    writer: &mut TaggedWriter<W>,
    name: &str,
    activation: Option<&Arc<dyn Activation>>,
) -> Result<()> {
    match activation {
        None => writer.write_null(),
        Some(act) => {
            let kind = act.kind().ok_or_else(|| {
                NetError::format(format!("activation {act:?} has no persistable identifier"))
            })?;
            writer.write_blob(name, &serde_json::to_vec(&kind)?)
        }
    }
}

fn read_activation(reader: &mut TaggedReader<'_>, name: &str) -> Result<Option<Arc<dyn Activation>>> {
    reader
        .read_blob(name)?
        .map(|bytes| {
            let kind: ActivationKind = serde_json::from_slice(&bytes)?;
            kind.to_arc()
        })
        .transpose()
}

fn mode_name(mode: PoolingMode) -> &'static str {
    match mode {
        PoolingMode::Max => "max",
        PoolingMode::Average => "average",
    }
}

fn write_layer<W: Write>(writer: &mut TaggedWriter<W>, layer: &Layer) -> Result<()> {
    match layer.kind() {
        LayerKind::Pooling(p) => {
            writer.write_text("layer_kind", "pooling")?;
            writer.write_int("channels", p.channels as u64)?;
            writer.write_int("height", p.height as u64)?;
            writer.write_int("width", p.width as u64)?;
            writer.write_int("size", p.size as u64)?;
            writer.write_int("stride", p.stride as u64)?;
            writer.write_text("mode", mode_name(p.mode))
        }
        LayerKind::Standard(nodes) => {
            writer.write_text("layer_kind", "standard")?;
            writer.write_int("input_dimension", layer.input_dimension() as u64)?;
            write_activation(writer, "activation", layer.activation())?;
            match layer.dropout() {
                Some(d) => writer.write_blob("dropout", &encode_dropout(d)?)?,
                None => writer.write_null()?,
            }
            writer.write_int("node_count", nodes.len() as u64)?;
            for node in nodes {
                match node {
                    Node::Dense(_) => writer.write_text("node_kind", "dense")?,
                    Node::Convolution(conv) => {
                        let g = conv.geometry();
                        writer.write_text("node_kind", "convolution")?;
                        writer.write_int("channels", g.channels as u64)?;
                        writer.write_int("height", g.height as u64)?;
                        writer.write_int("width", g.width as u64)?;
                        writer.write_int("kernel_height", g.kernel_height as u64)?;
                        writer.write_int("kernel_width", g.kernel_width as u64)?;
                        writer.write_int("stride", g.stride as u64)?;
                    }
                }
                write_activation(writer, "node_activation", node.activation())?;
                writer.write_blob("parameters", &encode_params(node)?)?;
            }
            Ok(())
        }
    }
}

fn read_node(reader: &mut TaggedReader<'_>) -> Result<Node> {
    let kind = reader.require_text("node_kind")?;
    let geometry = match kind.as_str() {
        "dense" => None,
        "convolution" => Some(ConvGeometry {
            channels: reader.require_usize("channels")?,
            height: reader.require_usize("height")?,
            width: reader.require_usize("width")?,
            kernel_height: reader.require_usize("kernel_height")?,
            kernel_width: reader.require_usize("kernel_width")?,
            stride: reader.require_usize("stride")?,
        }),
        other => return Err(NetError::format(format!("unknown node kind {other:?}"))),
    };
    let activation = read_activation(reader, "node_activation")?;
    let (weights, bias) = decode_params(&reader.require_blob("parameters")?)?;
    let mut node: Node = match geometry {
        None => DenseNode::new(weights, bias)?.into(),
        Some(g) => ConvNode::new(g, weights, bias)?.into(),
    };
    node.set_activation(activation);
    Ok(node)
}

fn read_layer(reader: &mut TaggedReader<'_>) -> Result<Layer> {
    let kind = reader.require_text("layer_kind")?;
    match kind.as_str() {
        "pooling" => {
            let channels = reader.require_usize("channels")?;
            let height = reader.require_usize("height")?;
            let width = reader.require_usize("width")?;
            let size = reader.require_usize("size")?;
            let stride = reader.require_usize("stride")?;
            let mode = match reader.require_text("mode")?.as_str() {
                "max" => PoolingMode::Max,
                "average" => PoolingMode::Average,
                other => return Err(NetError::format(format!("unknown pooling mode {other:?}"))),
            };
            Layer::pooling(Pooling {
                channels,
                height,
                width,
                size,
                stride,
                mode,
            })
        }
        "standard" => {
            let input_dimension = reader.require_usize("input_dimension")?;
            let activation = read_activation(reader, "activation")?;
            let dropout = reader
                .read_blob("dropout")?
                .map(|bytes| decode_dropout(&bytes))
                .transpose()?;
            let count = reader.require_usize("node_count")?;
            let nodes = (0..count)
                .map(|_| read_node(reader))
                .collect::<Result<Vec<_>>>()?;
            let mut layer = Layer::standard(input_dimension, nodes)?;
            if let Some(act) = activation {
                layer = layer.with_activation(act);
            }
            match dropout {
                Some(d) => layer.with_dropout(d),
                None => Ok(layer),
            }
        }
        other => Err(NetError::format(format!("unknown layer kind {other:?}"))),
    }
}

impl Network {
    /// Writes structure and parameters in the tagged format.
    pub fn write_to<W: Write>(&self, out: W) -> Result<W> {
        if !self.is_built() {
            return Err(NetError::Sequencing("only built networks can be serialized".into()));
        }
        let mut writer = TaggedWriter::new(out);
        writer.write_int("format", FORMAT_VERSION)?;
        writer.write_int("input_dimension", self.input_dimension() as u64)?;
        write_activation(&mut writer, "default_activation", self.default_activation())?;
        writer.write_int("layer_count", self.layers().len() as u64)?;
        for layer in self.layers() {
            write_layer(&mut writer, layer)?;
        }
        Ok(writer.into_inner())
    }

    pub fn serialize(&self) -> Result<String> {
        let bytes = self.write_to(Vec::new())?;
        String::from_utf8(bytes).map_err(|e| NetError::format(e.to_string()))
    }

    /// Rebuilds a network in inference mode; no further `build` call is needed.
    pub fn deserialize(text: &str) -> Result<Network> {
        let mut reader = TaggedReader::new(text);
        let version = reader.require_int("format")?;
        if version != FORMAT_VERSION {
            return Err(NetError::format(format!("unsupported format version {version}")));
        }
        let input_dimension = reader.require_usize("input_dimension")?;
        let default_activation = read_activation(&mut reader, "default_activation")?;
        let count = reader.require_usize("layer_count")?;
        let layers = (0..count)
            .map(|_| read_layer(&mut reader))
            .collect::<Result<Vec<_>>>()?;
        let network = Network::from_built_parts(input_dimension, default_activation, layers)?;
        debug!("deserialized {network}");
        Ok(network)
    }

    /// Save model to a gzip-compressed tagged file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = BufWriter::new(File::create(path)?);
        let enc = self.write_to(GzEncoder::new(file, Compression::default()))?;
        enc.finish()?.flush()?;
        Ok(())
    }

    /// Load model from a gzip-compressed tagged file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Network> {
        let mut text = String::new();
        GzDecoder::new(BufReader::new(File::open(path)?)).read_to_string(&mut text)?;
        Network::deserialize(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_use_fixed_precision_text() {
        let mut w = TaggedWriter::new(Vec::new());
        w.write_double("rate", 0.1).unwrap();
        w.write_int("count", 42).unwrap();
        w.write_null().unwrap();
        let text = String::from_utf8(w.into_inner()).unwrap();
        assert_eq!(text, "∫rate∫\n0.100000\n∂rate∂\n∫count∫\n42\n∂count∂\n∅∅\n");

        let mut r = TaggedReader::new(&text);
        assert_eq!(r.read_double("rate").unwrap(), Some(0.1));
        assert_eq!(r.read_int("count").unwrap(), Some(42));
        assert_eq!(r.read_double("anything").unwrap(), None);
    }

    #[test]
    fn end_tags_match_case_insensitively() {
        let mut r = TaggedReader::new("∫Width∫\n7\n∂WIDTH∂\n");
        assert_eq!(r.read_int("width").unwrap(), Some(7));
    }

    #[test]
    fn blobs_round_trip_across_wrapped_lines() {
        let bytes: Vec<u8> = (0..=255).collect();
        let mut w = TaggedWriter::new(Vec::new());
        w.write_blob("data", &bytes).unwrap();
        let text = String::from_utf8(w.into_inner()).unwrap();
        assert!(text.lines().count() > 3);
        assert_eq!(TaggedReader::new(&text).read_blob("data").unwrap(), Some(bytes));
    }

    #[test]
    fn malformed_blocks_are_format_errors() {
        let missing_begin = TaggedReader::new("42\n∂count∂\n").read_int("count");
        assert!(matches!(missing_begin, Err(NetError::Format(_))));

        let missing_end = TaggedReader::new("∫count∫\n42\n").read_int("count");
        assert!(matches!(missing_end, Err(NetError::Format(_))));

        let wrong_name = TaggedReader::new("∫size∫\n42\n∂size∂\n").read_int("count");
        assert!(matches!(wrong_name, Err(NetError::Format(_))));

        let wrong_end = TaggedReader::new("∫count∫\n42\n∂size∂\n").read_int("count");
        assert!(matches!(wrong_end, Err(NetError::Format(_))));

        assert!(TaggedReader::new("").read_int("count").is_err());
    }

    #[test]
    fn dropout_blob_is_validated_on_read() {
        let d = Dropout::new(0.75, 9).unwrap();
        assert_eq!(decode_dropout(&encode_dropout(&d).unwrap()).unwrap(), d);
        assert!(matches!(decode_dropout(&[0; 8]), Err(NetError::Format(_))));

        let mut bytes = Vec::new();
        bytes.write_f64::<LittleEndian>(1.0).unwrap();
        bytes.write_u64::<LittleEndian>(9).unwrap();
        assert!(matches!(decode_dropout(&bytes), Err(NetError::Format(_))));
    }

    #[test]
    fn illegal_names_and_text_are_rejected() {
        let mut w = TaggedWriter::new(Vec::new());
        assert!(w.write_int("two words", 1).is_err());
        assert!(w.write_int("∂x", 1).is_err());
        assert!(w.write_text("note", "∂note∂").is_err());
    }
}
