//! Builtin module registration: `register_error_classes` and
//! `register_funcs` run once, against the distinguished builtin module,
//! before any user file is resolved -- the identifier resolver later finds
//! these names through the builtin module's name maps exactly like it
//! would an imported module's.

use unicode_segmentation::UnicodeSegmentation;

use crate::program::value::ValueContent;
use crate::program::{Program, RegisterError};
use crate::vm::{Interpreter, RuntimeException, VmError};

const PRINT: &str = "print";
const LEN: &str = "len";

/// `register_error_classes`: the exception hierarchy every runtime
/// exception (div-by-zero, an unhandled builtin error, ...) is raised
/// against. `Exception` is the root every catch-all handler matches.
pub fn register_error_classes(program: &mut Program) -> Result<(), RegisterError> {
    let exception = program.add_class("Exception", None, None, None)?;
    let type_error = program.add_class("TypeError", None, None, None)?;
    let value_error = program.add_class("ValueError", None, None, None)?;
    let index_error = program.add_class("IndexError", None, None, None)?;
    let division_by_zero_error = program.add_class("DivisionByZeroError", None, None, None)?;

    program.set_class_base(type_error, exception);
    program.set_class_base(value_error, exception);
    program.set_class_base(index_error, exception);
    program.set_class_base(division_by_zero_error, exception);

    program.builtin_classes.exception = exception;
    program.builtin_classes.type_error = type_error;
    program.builtin_classes.value_error = value_error;
    program.builtin_classes.index_error = index_error;
    program.builtin_classes.division_by_zero_error = division_by_zero_error;
    Ok(())
}

/// `register_funcs`: the small set of free functions visible by bare name
/// in every source file. Each is registered as a C function (no
/// instruction buffer) and bound to a native closure the interpreter
/// dispatches to directly.
pub fn register_funcs(program: &mut Program) -> Result<(), RegisterError> {
    program.register_c_function(PRINT, Some(PRINT), None, 1, None, true, None, None, false, -1)?;
    program.register_c_function(LEN, Some(LEN), None, 1, None, false, None, None, false, -1)?;

    program.well_known.to_str = program.symbols.intern_member("to_str");
    program.well_known.length = program.symbols.intern_member("length");
    program.well_known.init = program.symbols.intern_member("init");
    program.well_known.destroy = program.symbols.intern_member("destroy");
    program.well_known.clone = program.symbols.intern_member("clone");
    program.well_known.equals = program.symbols.intern_member("equals");
    program.well_known.hash = program.symbols.intern_member("hash");
    Ok(())
}

/// Wire the native closures behind the function ids `register_funcs` just
/// created. Split from registration because an `Interpreter` (which owns
/// the native table) does not exist yet while the program object is being
/// built during resolution.
pub fn register_natives(interp: &mut Interpreter) {
    interp.register_native(0, native_print);
    interp.register_native(1, native_len);
}

fn native_print(interp: &mut Interpreter, program: &mut Program, args: &[ValueContent]) -> Result<ValueContent, VmError> {
    let rendered: Vec<String> = args.iter().map(|v| display_value(interp, program, v)).collect();
    println!("{}", rendered.join(" "));
    Ok(ValueContent::None)
}

fn native_len(interp: &mut Interpreter, program: &mut Program, args: &[ValueContent]) -> Result<ValueContent, VmError> {
    let _ = program;
    let arg = args.first().ok_or_else(|| VmError::Fatal("len() takes exactly one argument".to_string()))?;
    match arg {
        ValueContent::GcVal(h) => {
            let len = match &interp.heap.get(*h).payload {
                // Grapheme clusters, not code points: `len("e\u{301}")` is 1,
                // matching what a user looking at the string would count.
                crate::vm::heap::GcPayload::Str(s) => s.graphemes(true).count(),
                crate::vm::heap::GcPayload::List(items) => items.len(),
                crate::vm::heap::GcPayload::Set(items) => items.len(),
                crate::vm::heap::GcPayload::Vector(items) => items.len(),
                crate::vm::heap::GcPayload::Map(entries) => entries.len(),
                _ => {
                    return Err(VmError::Exception(RuntimeException {
                        class_id: program.builtin_classes.type_error,
                        message: Some("len() on a value with no length".to_string()),
                    }))
                }
            };
            Ok(ValueContent::Int64(len as i64))
        }
        _ => Err(VmError::Exception(RuntimeException {
            class_id: program.builtin_classes.type_error,
            message: Some("len() on a value with no length".to_string()),
        })),
    }
}

fn display_value(interp: &Interpreter, program: &Program, v: &ValueContent) -> String {
    match v {
        ValueContent::None => "none".to_string(),
        ValueContent::Bool(b) => b.to_string(),
        ValueContent::Int64(i) => i.to_string(),
        ValueContent::Float64(f) => f.to_string(),
        ValueContent::ConstPreallocStr(s) => s.clone(),
        ValueContent::GcVal(h) => match &interp.heap.get(*h).payload {
            crate::vm::heap::GcPayload::Str(s) => s.clone(),
            crate::vm::heap::GcPayload::Object { class_id, .. } => {
                format!("<{} instance>", program.classes.get(*class_id as usize).map(|c| c.name.as_str()).unwrap_or("?"))
            }
            crate::vm::heap::GcPayload::List(items) => format!("[{}]", items.len()),
            _ => "<value>".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_hierarchy_chains_every_builtin_class_to_exception() {
        let mut program = Program::new();
        register_error_classes(&mut program).unwrap();
        for class_id in [
            program.builtin_classes.type_error,
            program.builtin_classes.value_error,
            program.builtin_classes.index_error,
            program.builtin_classes.division_by_zero_error,
        ] {
            assert_eq!(program.classes[class_id as usize].base_class_id, Some(program.builtin_classes.exception));
        }
        assert_eq!(program.classes[program.builtin_classes.exception as usize].base_class_id, None);
    }

    #[test]
    fn register_funcs_interns_well_known_method_names_distinctly() {
        let mut program = Program::new();
        register_funcs(&mut program).unwrap();
        let ids = [
            program.well_known.to_str,
            program.well_known.length,
            program.well_known.init,
            program.well_known.destroy,
            program.well_known.clone,
            program.well_known.equals,
            program.well_known.hash,
        ];
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn native_len_counts_grapheme_clusters_not_code_points() {
        let mut program = Program::new();
        register_error_classes(&mut program).unwrap();
        register_funcs(&mut program).unwrap();
        let mut interp = Interpreter::new();
        register_natives(&mut interp);
        // "cafe" followed by a combining acute accent: 5 code points, 4
        // user-perceived characters.
        let handle = interp.heap.alloc_string("cafe\u{0301}".to_string());
        let result = native_len(&mut interp, &mut program, &[ValueContent::GcVal(handle)]).unwrap();
        assert_eq!(result, ValueContent::Int64(4));
    }

    #[test]
    fn native_len_on_an_unsupported_value_raises_type_error() {
        let mut program = Program::new();
        register_error_classes(&mut program).unwrap();
        let mut interp = Interpreter::new();
        let err = native_len(&mut interp, &mut program, &[ValueContent::Int64(5)]).unwrap_err();
        match err {
            crate::vm::VmError::Exception(exc) => assert_eq!(exc.class_id, program.builtin_classes.type_error),
            other => panic!("expected a TypeError exception, got {other:?}"),
        }
    }
}
