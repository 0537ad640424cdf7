use crate::chunk::{Proto, UpvalueDesc};
use crate::opcode::{OpCode, Rk};

/// Disassemble a [`Proto`] into a human-readable string.
///
/// Recursively disassembles any nested `protos[]` so you see the full picture.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    disasm_proto(proto, &mut out);
    out
}

fn disasm_proto(proto: &Proto, out: &mut String) {
    // Header
    let name: &str = if proto.source.is_empty() {
        "<?>"
    } else {
        &proto.source
    };
    out.push_str(&format!(
        "== {} ==  (params={}, vararg={}, registers={})\n",
        name, proto.param_count, proto.is_vararg, proto.max_registers
    ));

    if !proto.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            out.push_str(&format!("  [K{i}]  {c}\n"));
        }
    }

    if !proto.names.is_empty() {
        out.push_str("names:\n");
        for (i, n) in proto.names.iter().enumerate() {
            out.push_str(&format!("  [N{i}]  {n}\n"));
        }
    }

    if !proto.upvalue_descs.is_empty() {
        out.push_str("upvalues:\n");
        for (i, uv) in proto.upvalue_descs.iter().enumerate() {
            let desc = match uv {
                UpvalueDesc::Stack(reg) => format!("stack reg={reg}"),
                UpvalueDesc::Upvalue(idx) => format!("upvalue idx={idx}"),
            };
            out.push_str(&format!("  [U{i}]  {desc}\n"));
        }
    }

    out.push_str("instructions:\n");
    for (i, op) in proto.instructions.iter().enumerate() {
        let line = fmt_instruction(i, op, proto);
        out.push_str(&format!("  {line}\n"));
    }

    for (i, sub) in proto.protos.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("-- sub-proto {i} (of {}) --\n", proto.source));
        disasm_proto(sub, out);
    }
}

fn fmt_rk(rk: &Rk, proto: &Proto) -> String {
    match rk {
        Rk::Reg(r) => format!("r{r}"),
        Rk::Const(k) => {
            let val = proto
                .constants
                .get(*k as usize)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!("K{k}({val})")
        }
    }
}

fn fmt_count(c: &Option<u8>) -> String {
    match c {
        Some(n) => n.to_string(),
        None => "all".to_string(),
    }
}

fn fmt_name(idx: u16, proto: &Proto) -> String {
    let name = proto
        .names
        .get(idx as usize)
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!("N{idx}({name})")
}

fn fmt_instruction(idx: usize, op: &OpCode, proto: &Proto) -> String {
    let prefix = format!("{idx:04}");
    match op {
        OpCode::LoadConst { dst, index } => {
            let val = proto
                .constants
                .get(*index as usize)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!("{prefix}  LoadConst     dst={dst}  K{index}({val})")
        }
        OpCode::LoadNil { dst, count } => {
            format!("{prefix}  LoadNil       dst={dst}  count={count}")
        }
        OpCode::LoadBool { dst, value, skip } => {
            format!("{prefix}  LoadBool      dst={dst}  value={value}  skip={skip}")
        }
        OpCode::Move { dst, src } => format!("{prefix}  Move          dst={dst}  src={src}"),

        OpCode::GetUpvalue { dst, index } => {
            format!("{prefix}  GetUpvalue    dst={dst}  upval={index}")
        }
        OpCode::SetUpvalue { src, index } => {
            format!("{prefix}  SetUpvalue    src={src}  upval={index}")
        }
        OpCode::CloseUpvalues { from } => format!("{prefix}  CloseUpvalues from={from}"),
        OpCode::Closure { dst, proto } => {
            format!("{prefix}  Closure       dst={dst}  proto={proto}")
        }

        OpCode::GetGlobal { dst, name } => {
            format!("{prefix}  GetGlobal     dst={dst}  {}", fmt_name(*name, proto))
        }
        OpCode::SetGlobal { src, name } => {
            format!("{prefix}  SetGlobal     src={src}  {}", fmt_name(*name, proto))
        }

        OpCode::NewTable {
            dst,
            array_hint,
            hash_hint,
        } => format!("{prefix}  NewTable      dst={dst}  narr={array_hint}  nhash={hash_hint}"),
        OpCode::GetTable { dst, table, key } => {
            format!(
                "{prefix}  GetTable      dst={dst}  table={table}  key={}",
                fmt_rk(key, proto)
            )
        }
        OpCode::SetTable { table, key, value } => {
            format!(
                "{prefix}  SetTable      table={table}  key={}  val={}",
                fmt_rk(key, proto),
                fmt_rk(value, proto)
            )
        }
        OpCode::SetList {
            table,
            count,
            batch,
        } => format!(
            "{prefix}  SetList       table={table}  count={}  batch={batch}",
            fmt_count(count)
        ),

        OpCode::Arith { op, dst, lhs, rhs } => {
            format!(
                "{prefix}  Arith {:<5}   dst={dst}  lhs={}  rhs={}",
                format!("'{}'", op.symbol()),
                fmt_rk(lhs, proto),
                fmt_rk(rhs, proto)
            )
        }
        OpCode::Unm { dst, src } => format!("{prefix}  Unm           dst={dst}  src={src}"),
        OpCode::BNot { dst, src } => format!("{prefix}  BNot          dst={dst}  src={src}"),
        OpCode::Not { dst, src } => format!("{prefix}  Not           dst={dst}  src={src}"),
        OpCode::Len { dst, src } => format!("{prefix}  Len           dst={dst}  src={src}"),
        OpCode::Concat { dst, from, to } => {
            format!("{prefix}  Concat        dst={dst}  from={from}  to={to}")
        }

        OpCode::Eq { dst, lhs, rhs } => format!(
            "{prefix}  Eq            dst={dst}  lhs={}  rhs={}",
            fmt_rk(lhs, proto),
            fmt_rk(rhs, proto)
        ),
        OpCode::Lt { dst, lhs, rhs } => format!(
            "{prefix}  Lt            dst={dst}  lhs={}  rhs={}",
            fmt_rk(lhs, proto),
            fmt_rk(rhs, proto)
        ),
        OpCode::Le { dst, lhs, rhs } => format!(
            "{prefix}  Le            dst={dst}  lhs={}  rhs={}",
            fmt_rk(lhs, proto),
            fmt_rk(rhs, proto)
        ),

        OpCode::Jump { offset } => format!("{prefix}  Jump          offset={offset:+}"),
        OpCode::JumpIfTrue { src, offset } => {
            format!("{prefix}  JumpIfTrue    src={src}  offset={offset:+}")
        }
        OpCode::JumpIfFalse { src, offset } => {
            format!("{prefix}  JumpIfFalse   src={src}  offset={offset:+}")
        }
        OpCode::ForPrep { base, offset } => {
            format!("{prefix}  ForPrep       base={base}  offset={offset:+}")
        }
        OpCode::ForLoop { base, offset } => {
            format!("{prefix}  ForLoop       base={base}  offset={offset:+}")
        }
        OpCode::TForCall { base, want } => {
            format!("{prefix}  TForCall      base={base}  want={want}")
        }
        OpCode::TForLoop { base, offset } => {
            format!("{prefix}  TForLoop      base={base}  offset={offset:+}")
        }

        OpCode::VarArg { dst, want } => {
            format!("{prefix}  VarArg        dst={dst}  want={}", fmt_count(want))
        }
        OpCode::Call {
            func,
            args,
            results,
        } => format!(
            "{prefix}  Call          func={func}  args={}  results={}",
            fmt_count(args),
            fmt_count(results)
        ),
        OpCode::TailCall { func, args } => {
            format!("{prefix}  TailCall      func={func}  args={}", fmt_count(args))
        }
        OpCode::Return { first, count } => {
            format!("{prefix}  Return        first={first}  count={}", fmt_count(count))
        }
    }
}
