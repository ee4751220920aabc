//! On-disk bytecode file format for `-c`/`-o` (write) and `-b` (load).
//!
//! Ground: spec §6 ("a self-contained representation of a function object:
//! name, declared arity, vararg flag, upvalue count, local debug records,
//! and the chunk... multi-byte integers little-endian, versioned with a
//! magic prefix") plus the teacher's `serde/` module, which does the same
//! job for its register chunks with a hand-rolled reader/writer rather than
//! pulling in `serde`/`bincode` — strings are written as their actual UTF-8
//! bytes (not interner ids), so a loaded chunk reinterns every string
//! against whatever [`StringInterner`] the loading [`crate::vm::Vm`] owns,
//! which is what makes the round-trip content-addressed rather than
//! id-addressed (spec §8's round-trip property is stated "up to object
//! identity of interned strings" for exactly this reason).

use crate::chunk::{Chunk, FunctionProto, LocalDebug, UpvalueDesc};
use crate::gc::StringInterner;
use crate::value::{StringId, Value};
use std::rc::Rc;

const MAGIC: &[u8; 4] = b"LUMA";
const VERSION: u8 = 1;

pub fn serialize(proto: &FunctionProto, interner: &StringInterner) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    write_proto(&mut buf, proto, interner);
    buf
}

pub fn deserialize(bytes: &[u8], interner: &mut StringInterner) -> Result<FunctionProto, String> {
    let mut r = Reader { bytes, pos: 0 };
    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err("not a luma bytecode file (bad magic)".to_string());
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(format!("unsupported bytecode version {version}"));
    }
    read_proto(&mut r, interner)
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn write_opt_string(buf: &mut Vec<u8>, id: Option<StringId>, interner: &StringInterner) {
    match id {
        Some(id) => {
            buf.push(1);
            write_string(buf, interner.get(id.0));
        }
        None => buf.push(0),
    }
}

fn write_value(buf: &mut Vec<u8>, v: &Value, interner: &StringInterner) {
    match v {
        Value::Nil => buf.push(0),
        Value::Bool(b) => {
            buf.push(1);
            buf.push(*b as u8);
        }
        Value::Int(i) => {
            buf.push(2);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            buf.push(3);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(id) => {
            buf.push(4);
            write_string(buf, interner.get(id.0));
        }
        other => unreachable!("non-constant-foldable value in constant pool: {}", other.type_name()),
    }
}

fn write_chunk(buf: &mut Vec<u8>, chunk: &Chunk, interner: &StringInterner) {
    write_len(buf, chunk.code.len());
    buf.extend_from_slice(&chunk.code);
    write_len(buf, chunk.lines.len());
    for &line in &chunk.lines {
        buf.extend_from_slice(&line.to_le_bytes());
    }
    write_len(buf, chunk.constants.len());
    for c in &chunk.constants {
        write_value(buf, c, interner);
    }
    write_len(buf, chunk.functions.len());
    for f in &chunk.functions {
        write_proto(buf, f, interner);
    }
}

fn write_proto(buf: &mut Vec<u8>, proto: &FunctionProto, interner: &StringInterner) {
    write_opt_string(buf, proto.name, interner);
    buf.push(proto.arity);
    buf.push(proto.is_vararg as u8);
    write_len(buf, proto.upvalues.len());
    for uv in &proto.upvalues {
        buf.push(uv.is_local as u8);
        buf.push(uv.index);
    }
    buf.push(proto.num_slots);
    write_chunk(buf, &proto.chunk, interner);
    write_len(buf, proto.locals_debug.len());
    for l in &proto.locals_debug {
        write_string(buf, interner.get(l.name.0));
        buf.push(l.slot);
        buf.extend_from_slice(&l.start_pc.to_le_bytes());
        buf.extend_from_slice(&l.end_pc.to_le_bytes());
    }
    write_string(buf, &proto.source_name);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err("unexpected end of bytecode".to_string());
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, String> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn len(&mut self) -> Result<usize, String> {
        Ok(self.u32()? as usize)
    }

    fn string(&mut self) -> Result<String, String> {
        let n = self.len()?;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())
    }
}

fn read_opt_string(r: &mut Reader, interner: &mut StringInterner) -> Result<Option<StringId>, String> {
    match r.u8()? {
        0 => Ok(None),
        _ => Ok(Some(StringId(interner.intern(&r.string()?)))),
    }
}

fn read_value(r: &mut Reader, interner: &mut StringInterner) -> Result<Value, String> {
    Ok(match r.u8()? {
        0 => Value::Nil,
        1 => Value::Bool(r.u8()? != 0),
        2 => Value::Int(r.i64()?),
        3 => Value::Float(r.f64()?),
        4 => Value::Str(StringId(interner.intern(&r.string()?))),
        tag => return Err(format!("unknown constant tag {tag}")),
    })
}

fn read_chunk(r: &mut Reader, interner: &mut StringInterner) -> Result<Chunk, String> {
    let code_len = r.len()?;
    let code = r.take(code_len)?.to_vec();
    let lines_len = r.len()?;
    let mut lines = Vec::with_capacity(lines_len);
    for _ in 0..lines_len {
        lines.push(r.u32()?);
    }
    let consts_len = r.len()?;
    let mut constants = Vec::with_capacity(consts_len);
    for _ in 0..consts_len {
        constants.push(read_value(r, interner)?);
    }
    let funcs_len = r.len()?;
    let mut functions = Vec::with_capacity(funcs_len);
    for _ in 0..funcs_len {
        functions.push(Rc::new(read_proto(r, interner)?));
    }
    Ok(Chunk { code, lines, constants, functions })
}

fn read_proto(r: &mut Reader, interner: &mut StringInterner) -> Result<FunctionProto, String> {
    let name = read_opt_string(r, interner)?;
    let arity = r.u8()?;
    let is_vararg = r.u8()? != 0;
    let uv_len = r.len()?;
    let mut upvalues = Vec::with_capacity(uv_len);
    for _ in 0..uv_len {
        upvalues.push(UpvalueDesc { is_local: r.u8()? != 0, index: r.u8()? });
    }
    let num_slots = r.u8()?;
    let chunk = read_chunk(r, interner)?;
    let locals_len = r.len()?;
    let mut locals_debug = Vec::with_capacity(locals_len);
    for _ in 0..locals_len {
        let name = StringId(interner.intern(&r.string()?));
        let slot = r.u8()?;
        let start_pc = r.u32()?;
        let end_pc = r.u32()?;
        locals_debug.push(LocalDebug { name, slot, start_pc, end_pc });
    }
    let source_name: Rc<str> = Rc::from(r.string()?.as_str());
    Ok(FunctionProto { name, arity, is_vararg, upvalues, num_slots, chunk, locals_debug, source_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    #[test]
    fn round_trips_a_compiled_chunk() {
        let mut interner = StringInterner::new();
        let proto = Compiler::compile("local x = 1 + 2\nreturn x, 'hi'", "<test>", &mut interner).unwrap();
        let bytes = serialize(&proto, &interner);
        assert_eq!(&bytes[..4], MAGIC);

        let mut interner2 = StringInterner::new();
        let loaded = deserialize(&bytes, &mut interner2).unwrap();
        assert_eq!(loaded.arity, proto.arity);
        assert_eq!(loaded.is_vararg, proto.is_vararg);
        assert_eq!(loaded.chunk.code, proto.chunk.code);
        assert_eq!(loaded.chunk.constants.len(), proto.chunk.constants.len());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut interner = StringInterner::new();
        assert!(deserialize(b"nope", &mut interner).is_err());
    }
}
