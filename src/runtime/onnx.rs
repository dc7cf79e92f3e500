//! Minimal ONNX protobuf support for a single-node MatMul graph.
//!
//! Only the handful of `ModelProto` fields a MatMul model needs are written
//! and read. Unknown fields are skipped by wire type.

use crate::errors::{HarnessError, HarnessResult};

pub const IR_VERSION: u64 = 7;
pub const OPSET_VERSION: u64 = 13;
pub const GRAPH_NAME: &str = "gemm";
pub const MATMUL_OP: &str = "MatMul";

/// `TensorProto.DataType.FLOAT`.
const ELEM_TYPE_FLOAT: u64 = 1;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u32 = 5;

// ModelProto
const MODEL_IR_VERSION: u32 = 1;
const MODEL_GRAPH: u32 = 7;
const MODEL_OPSET_IMPORT: u32 = 8;
// OperatorSetIdProto
const OPSET_VERSION_FIELD: u32 = 2;
// GraphProto
const GRAPH_NODE: u32 = 1;
const GRAPH_NAME_FIELD: u32 = 5;
const GRAPH_INPUT: u32 = 11;
const GRAPH_OUTPUT: u32 = 12;
// NodeProto
const NODE_INPUT: u32 = 1;
const NODE_OUTPUT: u32 = 2;
const NODE_OP_TYPE: u32 = 4;
// ValueInfoProto / TypeProto / TypeProto.Tensor / TensorShapeProto
const VALUE_NAME: u32 = 1;
const VALUE_TYPE: u32 = 2;
const TYPE_TENSOR: u32 = 1;
const TENSOR_ELEM_TYPE: u32 = 1;
const TENSOR_SHAPE: u32 = 2;
const SHAPE_DIM: u32 = 1;
const DIM_VALUE: u32 = 1;

/// A named float tensor declared as a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueInfo {
    pub name: String,
    pub dims: Vec<u64>,
}

/// Decoded `C = MatMul(A, B)` model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatMulGraph {
    pub ir_version: u64,
    pub opset_version: u64,
    pub name: String,
    pub inputs: [ValueInfo; 2],
    pub output: ValueInfo,
}

impl MatMulGraph {
    /// `(m, k, n)` of the multiplication.
    pub fn dims(&self) -> (usize, usize, usize) {
        let a = &self.inputs[0].dims;
        let b = &self.inputs[1].dims;
        (a[0] as usize, a[1] as usize, b[1] as usize)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|input| input.name.clone()).collect()
    }
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value > 0x7f {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn put_tag(out: &mut Vec<u8>, field: u32, wire_type: u64) {
    put_varint(out, ((field as u64) << 3) | wire_type);
}

fn put_uint(out: &mut Vec<u8>, field: u32, value: u64) {
    put_tag(out, field, WIRE_VARINT);
    put_varint(out, value);
}

fn put_bytes(out: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_tag(out, field, WIRE_LEN);
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn value_info(name: &str, dims: &[u64]) -> Vec<u8> {
    let mut shape = Vec::new();
    for &dim in dims {
        let mut dimension = Vec::new();
        put_uint(&mut dimension, DIM_VALUE, dim);
        put_bytes(&mut shape, SHAPE_DIM, &dimension);
    }

    let mut tensor = Vec::new();
    put_uint(&mut tensor, TENSOR_ELEM_TYPE, ELEM_TYPE_FLOAT);
    put_bytes(&mut tensor, TENSOR_SHAPE, &shape);

    let mut type_proto = Vec::new();
    put_bytes(&mut type_proto, TYPE_TENSOR, &tensor);

    let mut info = Vec::new();
    put_bytes(&mut info, VALUE_NAME, name.as_bytes());
    put_bytes(&mut info, VALUE_TYPE, &type_proto);
    info
}

/// Serializes a model computing `C[m,n] = A[m,k] * B[k,n]`.
pub fn encode_matmul_model(m: u32, k: u32, n: u32) -> Vec<u8> {
    let (m, k, n) = (m as u64, k as u64, n as u64);

    let mut node = Vec::new();
    put_bytes(&mut node, NODE_INPUT, b"A");
    put_bytes(&mut node, NODE_INPUT, b"B");
    put_bytes(&mut node, NODE_OUTPUT, b"C");
    put_bytes(&mut node, NODE_OP_TYPE, MATMUL_OP.as_bytes());

    let mut graph = Vec::new();
    put_bytes(&mut graph, GRAPH_NODE, &node);
    put_bytes(&mut graph, GRAPH_NAME_FIELD, GRAPH_NAME.as_bytes());
    put_bytes(&mut graph, GRAPH_INPUT, &value_info("A", &[m, k]));
    put_bytes(&mut graph, GRAPH_INPUT, &value_info("B", &[k, n]));
    put_bytes(&mut graph, GRAPH_OUTPUT, &value_info("C", &[m, n]));

    let mut opset = Vec::new();
    put_uint(&mut opset, OPSET_VERSION_FIELD, OPSET_VERSION);

    let mut model = Vec::new();
    put_uint(&mut model, MODEL_IR_VERSION, IR_VERSION);
    put_bytes(&mut model, MODEL_OPSET_IMPORT, &opset);
    put_bytes(&mut model, MODEL_GRAPH, &graph);
    model
}

fn malformed(message: impl Into<String>) -> HarnessError {
    HarnessError::session(format!("malformed model: {}", message.into()))
}

enum Field<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Skipped,
}

struct ProtoReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn has_more(&self) -> bool {
        self.pos < self.data.len()
    }

    fn read_varint(&mut self) -> HarnessResult<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| malformed("unexpected end of data"))?;
            self.pos += 1;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(malformed("varint overflow"));
            }
        }
    }

    fn take(&mut self, len: usize) -> HarnessResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed("field extends past end of data"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Reads the next field as `(field number, value)`.
    fn next_field(&mut self) -> HarnessResult<(u32, Field<'a>)> {
        let tag = self.read_varint()?;
        let field = (tag >> 3) as u32;
        let value = match (tag & 0x7) as u32 {
            0 => Field::Varint(self.read_varint()?),
            2 => {
                let len = self.read_varint()? as usize;
                Field::Bytes(self.take(len)?)
            }
            WIRE_FIXED64 => {
                self.take(8)?;
                Field::Skipped
            }
            WIRE_FIXED32 => {
                self.take(4)?;
                Field::Skipped
            }
            other => return Err(malformed(format!("unsupported wire type {}", other))),
        };
        Ok((field, value))
    }
}

fn utf8(bytes: &[u8]) -> HarnessResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid UTF-8 in string field"))
}

struct Node {
    inputs: Vec<String>,
    outputs: Vec<String>,
    op_type: String,
}

fn decode_node(data: &[u8]) -> HarnessResult<Node> {
    let mut reader = ProtoReader::new(data);
    let mut node = Node {
        inputs: Vec::new(),
        outputs: Vec::new(),
        op_type: String::new(),
    };
    while reader.has_more() {
        match reader.next_field()? {
            (NODE_INPUT, Field::Bytes(b)) => node.inputs.push(utf8(b)?),
            (NODE_OUTPUT, Field::Bytes(b)) => node.outputs.push(utf8(b)?),
            (NODE_OP_TYPE, Field::Bytes(b)) => node.op_type = utf8(b)?,
            _ => {}
        }
    }
    Ok(node)
}

fn decode_shape(data: &[u8]) -> HarnessResult<Vec<u64>> {
    let mut reader = ProtoReader::new(data);
    let mut dims = Vec::new();
    while reader.has_more() {
        if let (SHAPE_DIM, Field::Bytes(dimension)) = reader.next_field()? {
            let mut inner = ProtoReader::new(dimension);
            let mut value = None;
            while inner.has_more() {
                if let (DIM_VALUE, Field::Varint(v)) = inner.next_field()? {
                    value = Some(v);
                }
            }
            dims.push(value.ok_or_else(|| malformed("symbolic dimensions are not supported"))?);
        }
    }
    Ok(dims)
}

fn decode_value_info(data: &[u8]) -> HarnessResult<ValueInfo> {
    let mut reader = ProtoReader::new(data);
    let mut name = String::new();
    let mut dims = Vec::new();
    let mut elem_type = None;

    while reader.has_more() {
        match reader.next_field()? {
            (VALUE_NAME, Field::Bytes(b)) => name = utf8(b)?,
            (VALUE_TYPE, Field::Bytes(type_proto)) => {
                let mut types = ProtoReader::new(type_proto);
                while types.has_more() {
                    if let (TYPE_TENSOR, Field::Bytes(tensor)) = types.next_field()? {
                        let mut fields = ProtoReader::new(tensor);
                        while fields.has_more() {
                            match fields.next_field()? {
                                (TENSOR_ELEM_TYPE, Field::Varint(v)) => elem_type = Some(v),
                                (TENSOR_SHAPE, Field::Bytes(shape)) => dims = decode_shape(shape)?,
                                _ => {}
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if elem_type != Some(ELEM_TYPE_FLOAT) {
        return Err(malformed(format!("tensor '{}' is not float32", name)));
    }
    if dims.len() != 2 || dims.contains(&0) {
        return Err(malformed(format!(
            "tensor '{}' must be a non-empty matrix, got shape {:?}",
            name, dims
        )));
    }
    Ok(ValueInfo { name, dims })
}

/// Parses and validates a single-node MatMul model.
pub fn decode_matmul_model(bytes: &[u8]) -> HarnessResult<MatMulGraph> {
    let mut reader = ProtoReader::new(bytes);
    let mut ir_version = 0;
    let mut opset_version = 0;
    let mut graph_bytes = None;

    while reader.has_more() {
        match reader.next_field()? {
            (MODEL_IR_VERSION, Field::Varint(v)) => ir_version = v,
            (MODEL_OPSET_IMPORT, Field::Bytes(opset)) => {
                let mut inner = ProtoReader::new(opset);
                while inner.has_more() {
                    if let (OPSET_VERSION_FIELD, Field::Varint(v)) = inner.next_field()? {
                        opset_version = v;
                    }
                }
            }
            (MODEL_GRAPH, Field::Bytes(graph)) => graph_bytes = Some(graph),
            _ => {}
        }
    }

    let graph_bytes = graph_bytes.ok_or_else(|| malformed("model has no graph"))?;
    let mut reader = ProtoReader::new(graph_bytes);
    let mut nodes = Vec::new();
    let mut name = String::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    while reader.has_more() {
        match reader.next_field()? {
            (GRAPH_NODE, Field::Bytes(b)) => nodes.push(decode_node(b)?),
            (GRAPH_NAME_FIELD, Field::Bytes(b)) => name = utf8(b)?,
            (GRAPH_INPUT, Field::Bytes(b)) => inputs.push(decode_value_info(b)?),
            (GRAPH_OUTPUT, Field::Bytes(b)) => outputs.push(decode_value_info(b)?),
            _ => {}
        }
    }

    let [node] = nodes.as_slice() else {
        return Err(malformed(format!("expected one node, found {}", nodes.len())));
    };
    if node.op_type != MATMUL_OP {
        return Err(malformed(format!("unsupported operator '{}'", node.op_type)));
    }

    let Ok([a, b]) = <[ValueInfo; 2]>::try_from(inputs) else {
        return Err(malformed("expected exactly two graph inputs"));
    };
    let Some(output) = outputs.into_iter().next() else {
        return Err(malformed("graph has no output"));
    };

    if node.inputs != [a.name.as_str(), b.name.as_str()] || node.outputs != [output.name.as_str()] {
        return Err(malformed("node wiring does not match graph inputs and outputs"));
    }
    if a.dims[1] != b.dims[0] || output.dims != [a.dims[0], b.dims[1]] {
        return Err(malformed(format!(
            "incompatible shapes {:?} x {:?} -> {:?}",
            a.dims, b.dims, output.dims
        )));
    }

    Ok(MatMulGraph {
        ir_version,
        opset_version,
        name,
        inputs: [a, b],
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        put_varint(&mut out, 300);
        assert_eq!(out, [0xac, 0x02]);

        let mut out = Vec::new();
        put_varint(&mut out, 1);
        assert_eq!(out, [0x01]);
    }

    #[test]
    fn test_model_header_bytes() {
        let bytes = encode_matmul_model(2, 3, 4);
        // ir_version = 7, then opset_import { version = 13 }
        assert_eq!(&bytes[..6], &[0x08, 0x07, 0x42, 0x02, 0x10, 0x0d]);
    }

    #[test]
    fn test_decode_recovers_matmul_graph() {
        let graph = decode_matmul_model(&encode_matmul_model(1024, 512, 256)).unwrap();

        assert_eq!(graph.ir_version, IR_VERSION);
        assert_eq!(graph.opset_version, OPSET_VERSION);
        assert_eq!(graph.name, GRAPH_NAME);
        assert_eq!(graph.input_names(), vec!["A", "B"]);
        assert_eq!(graph.output.name, "C");
        assert_eq!(graph.dims(), (1024, 512, 256));
    }

    #[test]
    fn test_truncated_model_is_rejected() {
        let bytes = encode_matmul_model(4, 4, 4);
        let result = decode_matmul_model(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(HarnessError::SessionError { .. })));
    }

    #[test]
    fn test_model_without_graph_is_rejected() {
        let mut bytes = Vec::new();
        put_uint(&mut bytes, MODEL_IR_VERSION, IR_VERSION);
        let err = decode_matmul_model(&bytes).unwrap_err();
        assert!(err.to_string().contains("model has no graph"));
    }
}
