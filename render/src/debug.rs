//! Command-stream debugging: graph dumps and shader-trace decoding.
//!
//! The dump is a human-readable rendition of one submitted graph: tasks in
//! their scheduled order, dependency edges, and the barriers the solver
//! inserted. Shader traces are storage buffers filled by instrumented
//! shaders; after the owning frame retires they are decoded into one textual
//! report per recorded invocation and delivered through the callback
//! installed with `set_shader_debug_callback`.

use crate::command::TaskNode;
use crate::driver::CmdPipelineBarrier;
use crate::pipeline::ShaderStageFlags;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::{Directed, Graph};
use std::fmt::Write;

/// Receiver for decoded shader traces:
/// `(task name, shader name, stages, outputs)`.
pub type ShaderDebugCallback =
    Box<dyn Fn(&str, &str, ShaderStageFlags, &[String]) + Send + 'static>;

/// Fixed size of one trace storage buffer.
pub(crate) const TRACE_BUFFER_SIZE: u64 = 4096;
/// Byte offset of the write cursor (in u32 words past the record area
/// start).
const TRACE_CURSOR_OFFSET: usize = 16;
/// Byte offset of the first record.
const TRACE_RECORDS_OFFSET: usize = 32;

/// Value type tags understood by the decoder.
pub const TRACE_TYPE_UINT: u32 = 0;
pub const TRACE_TYPE_INT: u32 = 1;
pub const TRACE_TYPE_FLOAT: u32 = 2;
pub const TRACE_TYPE_UINT3: u32 = 3;
pub const TRACE_TYPE_VOID: u32 = 4;

/// Header written by the core before the instrumented dispatch: the selected
/// invocation and an enable flag. The shader compares its own invocation id
/// against this and records only on match.
pub(crate) fn trace_header(coord: [u32; 3]) -> Vec<u8> {
    let mut header = Vec::with_capacity(TRACE_RECORDS_OFFSET);
    for word in &[coord[0], coord[1], coord[2], 1u32] {
        header.extend_from_slice(&word.to_le_bytes());
    }
    // Zeroed cursor + reserved words.
    header.resize(TRACE_RECORDS_OFFSET, 0);
    header
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Decodes one trace buffer into per-invocation reports.
///
/// Record layout (little-endian u32 words):
/// `line, type_tag, name_len, value_count, name bytes (padded to 4),
/// values...`. An `invocation separator` record has `name_len == 0` and
/// `type_tag == TRACE_TYPE_VOID`; the decoder starts a new report there.
pub(crate) fn decode_trace(bytes: &[u8]) -> Vec<String> {
    let words_written = match read_u32(bytes, TRACE_CURSOR_OFFSET) {
        Some(w) => w as usize,
        None => return Vec::new(),
    };
    let end = (TRACE_RECORDS_OFFSET + words_written * 4).min(bytes.len());
    let mut outputs = Vec::new();
    let mut current = String::new();
    let mut offset = TRACE_RECORDS_OFFSET;
    while offset + 16 <= end {
        let line = read_u32(bytes, offset).unwrap_or(0);
        let type_tag = read_u32(bytes, offset + 4).unwrap_or(TRACE_TYPE_VOID);
        let name_len = read_u32(bytes, offset + 8).unwrap_or(0) as usize;
        let value_count = read_u32(bytes, offset + 12).unwrap_or(0) as usize;
        offset += 16;

        if name_len == 0 && type_tag == TRACE_TYPE_VOID && value_count == 0 {
            if !current.is_empty() {
                outputs.push(std::mem::replace(&mut current, String::new()));
            }
            continue;
        }

        let padded = (name_len + 3) & !3;
        let name = bytes
            .get(offset..offset + name_len)
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or("<corrupt>");
        offset += padded;

        let mut values = Vec::with_capacity(value_count);
        for i in 0..value_count {
            values.push(read_u32(bytes, offset + i * 4).unwrap_or(0));
        }
        offset += value_count * 4;

        let rendered = match type_tag {
            TRACE_TYPE_FLOAT => values
                .iter()
                .map(|&v| format!("{:.6}", f32::from_bits(v)))
                .collect::<Vec<_>>()
                .join(", "),
            TRACE_TYPE_INT => values
                .iter()
                .map(|&v| format!("{}", v as i32))
                .collect::<Vec<_>>()
                .join(", "),
            _ => values
                .iter()
                .map(|&v| format!("{}", v))
                .collect::<Vec<_>>()
                .join(", "),
        };
        let type_name = match type_tag {
            TRACE_TYPE_UINT => "uint",
            TRACE_TYPE_INT => "int",
            TRACE_TYPE_FLOAT => "float",
            TRACE_TYPE_UINT3 => "uint3",
            _ => "void",
        };
        if type_tag == TRACE_TYPE_VOID {
            let _ = writeln!(current, "//> {}(): void", name);
        } else {
            let _ = writeln!(current, "//> {}: {} {{{}}}", name, type_name, rendered);
        }
        let _ = writeln!(current, "{}.", line);
        let _ = writeln!(current);
    }
    if !current.is_empty() {
        outputs.push(current);
    }
    outputs
}

/// Renders one scheduled graph as text: tasks in execution order, edges,
/// inserted barriers and recording diagnostics.
pub(crate) fn dump_graph(
    name: Option<&str>,
    tasks: &[TaskNode],
    graph: &Graph<u32, (), Directed, u32>,
    order: &[NodeIndex<u32>],
    barriers: &[(u32, Vec<CmdPipelineBarrier>)],
    diagnostics: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== frame graph: {} ==", name.unwrap_or("<unnamed>"));
    let _ = writeln!(out, "tasks ({}):", tasks.len());
    for &node in order {
        let index = graph[node] as usize;
        let task = &tasks[index];
        let _ = write!(
            out,
            "  [{}] {}",
            index,
            task.name.as_deref().unwrap_or(task.kind.kind_name())
        );
        if task.invalid {
            let _ = write!(out, " (skipped: invalid)");
        }
        let _ = writeln!(out);
        for access in &task.accesses {
            let _ = writeln!(
                out,
                "      access {:?} stages={:?} mask={:?} layout={:?}",
                access.resource, access.stage, access.access, access.layout
            );
        }
    }
    let _ = writeln!(out, "edges:");
    for edge in graph.edge_references() {
        let _ = writeln!(
            out,
            "  {} -> {}",
            graph[edge.source()],
            graph[edge.target()]
        );
    }
    if !barriers.is_empty() {
        let _ = writeln!(out, "barriers:");
        for (task, list) in barriers {
            for barrier in list {
                let _ = writeln!(
                    out,
                    "  before [{}]: {:?} -> {:?} ({} image, {} buffer, {} memory)",
                    task,
                    barrier.src_stage_mask,
                    barrier.dst_stage_mask,
                    barrier.images.len(),
                    barrier.buffers.len(),
                    barrier.memory.len()
                );
                for image in &barrier.images {
                    let _ = writeln!(
                        out,
                        "      image {:?}: {:?} -> {:?}",
                        image.image, image.old_layout, image.new_layout
                    );
                }
            }
        }
    }
    if !diagnostics.is_empty() {
        let _ = writeln!(out, "diagnostics:");
        for diagnostic in diagnostics {
            let _ = writeln!(out, "  warning: {}", diagnostic);
        }
    }
    out
}

/// Helper for trace-producing drivers and tests: appends one record to a
/// trace buffer, honoring the cursor and capacity.
pub fn trace_write_record(
    buffer: &mut [u8],
    line: u32,
    type_tag: u32,
    name: &str,
    values: &[u32],
) -> bool {
    let cursor_words = match read_u32(buffer, TRACE_CURSOR_OFFSET) {
        Some(w) => w as usize,
        None => return false,
    };
    let name_len = name.len();
    let padded = (name_len + 3) & !3;
    let record_bytes = 16 + padded + values.len() * 4;
    let offset = TRACE_RECORDS_OFFSET + cursor_words * 4;
    if offset + record_bytes > buffer.len() {
        return false;
    }
    let mut cursor = offset;
    for word in &[line, type_tag, name_len as u32, values.len() as u32] {
        buffer[cursor..cursor + 4].copy_from_slice(&word.to_le_bytes());
        cursor += 4;
    }
    buffer[cursor..cursor + name_len].copy_from_slice(name.as_bytes());
    cursor += padded;
    for value in values {
        buffer[cursor..cursor + 4].copy_from_slice(&value.to_le_bytes());
        cursor += 4;
    }
    let new_words = (cursor_words * 4 + record_bytes) / 4;
    buffer[TRACE_CURSOR_OFFSET..TRACE_CURSOR_OFFSET + 4]
        .copy_from_slice(&(new_words as u32).to_le_bytes());
    true
}

/// Reads the debug coordinate out of a trace header, if tracing is enabled.
pub fn trace_coordinate(buffer: &[u8]) -> Option<[u32; 3]> {
    let enabled = read_u32(buffer, 12)?;
    if enabled == 0 {
        return None;
    }
    Some([
        read_u32(buffer, 0)?,
        read_u32(buffer, 4)?,
        read_u32(buffer, 8)?,
    ])
}

/// Ends the current invocation's report; see [`decode_trace`].
pub fn trace_end_invocation(buffer: &mut [u8]) -> bool {
    trace_write_record(buffer, 0, TRACE_TYPE_VOID, "", &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_roundtrip() {
        let mut buffer = trace_header([8, 8, 0]);
        buffer.resize(TRACE_BUFFER_SIZE as usize, 0);
        assert_eq!(trace_coordinate(&buffer), Some([8, 8, 0]));
        assert!(trace_write_record(
            &mut buffer,
            11,
            TRACE_TYPE_UINT,
            "index",
            &[136]
        ));
        assert!(trace_write_record(
            &mut buffer,
            13,
            TRACE_TYPE_FLOAT,
            "value",
            &[0.53125f32.to_bits()]
        ));
        assert!(trace_end_invocation(&mut buffer));
        let outputs = decode_trace(&buffer);
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].contains("//> index: uint {136}"));
        assert!(outputs[0].contains("//> value: float {0.531250}"));
        assert!(outputs[0].contains("11."));
    }

    #[test]
    fn empty_trace_has_no_outputs() {
        let mut buffer = trace_header([0, 0, 0]);
        buffer.resize(256, 0);
        assert!(decode_trace(&buffer).is_empty());
    }

    #[test]
    fn capacity_is_respected() {
        let mut buffer = trace_header([0, 0, 0]);
        buffer.resize(64, 0);
        // 16-byte header record + name + one value does not fit in 32 bytes.
        assert!(trace_write_record(&mut buffer, 1, TRACE_TYPE_UINT, "x", &[1]));
        assert!(!trace_write_record(
            &mut buffer,
            2,
            TRACE_TYPE_UINT,
            "a_rather_long_variable_name",
            &[1, 2, 3, 4]
        ));
    }
}
