#![no_main]
use libfuzzer_sys::fuzz_target;

use relax_rs::{layout, Contents, Diagnostics, JumpForm, Object, Value};

fuzz_target!(|data: &[u8]| {
    // Decode the input as a little layout program: two bytes per item.
    // The fixpoint must never panic — only converge or report errors.
    let mut obj = Object::new();
    let text = obj.add_section(".text");
    let n = data.len() / 2;

    for (i, pair) in data.chunks_exact(2).enumerate() {
        let line = i as u32 + 1;
        let _ = obj.define_label(&format!("L{i}"), text, line);
        match pair[0] % 6 {
            0 => {
                obj.append_data(text, &[pair[1]], line);
            }
            1 => {
                obj.append_gap(text, u64::from(pair[1]) * 3 + 1, 0, line);
            }
            2 => {
                let t = usize::from(pair[1]) % n.max(1);
                let sym = obj.use_symbol(&format!("L{t}"), line);
                obj.append(
                    text,
                    Contents::Jump {
                        target: Value::from_sym(sym, 8),
                        short: JumpForm::new(vec![0xEB], 1),
                        long: JumpForm::new(vec![0xE9], 4),
                        is_long: false,
                    },
                    line,
                );
            }
            3 => {
                obj.append(
                    text,
                    Contents::Align {
                        alignment: 1u64 << (pair[1] % 8),
                        fill: 0x90,
                        max_skip: None,
                    },
                    line,
                );
            }
            4 => {
                obj.append(
                    text,
                    Contents::Times {
                        count: Value::from_expr(relax_rs::Expr::Int(i64::from(pair[1] % 16)), 64),
                        body: vec![0],
                    },
                    line,
                );
            }
            5 => {
                obj.append(
                    text,
                    Contents::Org {
                        target: u64::from(pair[1]) * 4,
                        fill: 0,
                    },
                    line,
                );
            }
            _ => unreachable!(),
        }
    }

    let mut diag = Diagnostics::new();
    if layout(&mut obj, &mut diag) {
        let _ = obj.emit_section(text);
    }
});
