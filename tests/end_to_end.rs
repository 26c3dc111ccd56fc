//! Cross-module integration tests: the concrete end-to-end scenarios.
//! Unit tests inside each module file cover the properties that need
//! access to private state; everything here drives only the public
//! lexer/parser/resolver/lowering/VM surface, the way `emberc` itself does.

use std::cell::RefCell;
use std::collections::HashMap;

use pretty_assertions::assert_eq;

use emberlang::lexer::{tokenize, Token};
use emberlang::pathutil::normalize;
use emberlang::program::value::ValueContent;
use emberlang::program::Program;
use emberlang::resolver::{LoaderError, ProjectLoader, Resolver};
use emberlang::{builtins, lowering, vm};

struct MemoryLoader {
    files: RefCell<HashMap<String, String>>,
}

impl MemoryLoader {
    fn new(files: &[(&str, &str)]) -> Self {
        let files = files.iter().map(|(uri, src)| ((*uri).to_string(), (*src).to_string())).collect();
        Self { files: RefCell::new(files) }
    }
}

impl ProjectLoader for MemoryLoader {
    fn get_file_sub_project_path(&self, _file_uri: &str) -> Result<(String, Option<String>), LoaderError> {
        Ok(("file:///proj".to_string(), None))
    }

    fn resolve_import(&self, _source_file_uri: &str, import_elements: &[String], _library: Option<&str>) -> Result<String, LoaderError> {
        Ok(format!("file:///proj/{}.ember", import_elements.join("/")))
    }

    fn read_source(&self, file_uri: &str) -> Result<String, LoaderError> {
        self.files.borrow().get(file_uri).cloned().ok_or_else(|| LoaderError::NotFound(file_uri.to_string()))
    }
}

fn fresh_program() -> Program {
    let mut program = Program::new();
    builtins::register_error_classes(&mut program).unwrap();
    builtins::register_funcs(&mut program).unwrap();
    program
}

#[test]
fn scenario_1_mixed_numeric_literal_bases() {
    let tokens = tokenize("1.5 + 0xA + 0b10");
    let kinds: Vec<&Token> = tokens.iter().map(|s| &s.token).collect();
    assert_eq!(
        kinds,
        vec![&Token::Float(1.5), &Token::Plus, &Token::Int(10), &Token::Plus, &Token::Int(2), &Token::Eof]
    );
}

#[test]
fn scenario_2_leading_minus_is_contextual() {
    let tokens = tokenize("-10");
    assert_eq!(tokens.iter().map(|s| &s.token).collect::<Vec<_>>(), vec![&Token::Int(-10), &Token::Eof]);

    let tokens = tokenize("1-10");
    assert_eq!(
        tokens.iter().map(|s| &s.token).collect::<Vec<_>>(),
        vec![&Token::Int(1), &Token::Minus, &Token::Int(10), &Token::Eof]
    );
}

#[test]
fn scenario_3_utf8_escape_decodes_or_reports_invalid() {
    let tokens = tokenize("\"\\xc3\\xb6\"");
    assert_eq!(tokens.len(), 2);
    match &tokens[0].token {
        Token::Str(s) => assert_eq!(s.as_bytes(), [0xc3, 0xb6]),
        other => panic!("expected a decoded string token, got {other:?}"),
    }

    let tokens = tokenize("\"\\xc3\\xc3\"");
    assert_eq!(tokens.iter().filter(|s| s.token == Token::Invalid).count(), 1);
}

#[test]
fn scenario_4_cross_file_import_resolves_and_marks_usage() {
    let loader = MemoryLoader::new(&[
        ("file:///proj/a.ember", "import b\nfunc main { b.f() }"),
        ("file:///proj/b.ember", "func f { return }"),
    ]);
    let mut resolver = Resolver::new(loader);
    let mut program = fresh_program();

    let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
    let ast = resolver.ast(entry);
    assert!(ast.result_messages.success, "{:?}", ast.result_messages.messages);
    assert_eq!(program.main_func_id, 0);

    let asts = resolver.into_asts();
    let b = asts.iter().find(|a| a.fileuri == "file:///proj/b.ember").unwrap();

    let f_def_id = b.scope.lookup(b.scope.root(), "f").unwrap();
    assert!(b.scope.def(f_def_id).ever_used);
}

#[test]
fn scenario_5_duplicate_main_is_diagnosed_but_first_wins() {
    let loader = MemoryLoader::new(&[("file:///proj/a.ember", "func main { return }\nfunc main { return }")]);
    let mut resolver = Resolver::new(loader);
    let mut program = fresh_program();

    let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
    let ast = resolver.ast(entry);
    assert!(!ast.result_messages.success);
    assert!(ast.result_messages.messages.iter().any(|m| m.message.contains("duplicate main")));
    assert_eq!(program.main_func_id, 0);
}

#[test]
fn scenario_6_path_normalization_is_platform_neutral() {
    assert_eq!(normalize("u//abc/def/..u/../.."), "u/abc");
    assert_eq!(normalize("../abc/def/..u/../.."), "../abc");
}

#[test]
fn scenario_7_execute_program_leaves_constant_return_value_and_restores_stack_floor() {
    let loader = MemoryLoader::new(&[("file:///proj/a.ember", "func main { return f() }\nfunc f { return 42 }")]);
    let mut resolver = Resolver::new(loader);
    let mut program = fresh_program();

    let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
    assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);

    let asts = resolver.into_asts();
    lowering::lower_program(&asts, &mut program).unwrap();

    let mut interp = vm::Interpreter::new();
    builtins::register_natives(&mut interp);
    let floor_before = interp.stack.len();
    let result = interp.execute_function(&mut program, program.main_func_id, &[]).unwrap();
    assert_eq!(result, ValueContent::Int64(42));
    assert_eq!(interp.stack.len(), floor_before);
}

#[test]
fn execute_program_reports_exit_code_zero_on_a_clean_run() {
    let loader = MemoryLoader::new(&[("file:///proj/a.ember", "func main { return }")]);
    let mut resolver = Resolver::new(loader);
    let mut program = fresh_program();

    let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
    assert!(resolver.ast(entry).result_messages.success);

    let asts = resolver.into_asts();
    lowering::lower_program(&asts, &mut program).unwrap();
    assert_eq!(vm::execute_program(&mut program), 0);
}

#[test]
fn class_inheritance_links_base_class_id_end_to_end() {
    let loader = MemoryLoader::new(&[("file:///proj/a.ember", "class Animal { }\nclass Dog(Animal) { }\nfunc main { return }")]);
    let mut resolver = Resolver::new(loader);
    let mut program = fresh_program();

    let entry = resolver.resolve_entry(&mut program, "file:///proj/a.ember", true).unwrap();
    assert!(resolver.ast(entry).result_messages.success, "{:?}", resolver.ast(entry).result_messages.messages);

    let asts = resolver.into_asts();
    lowering::lower_program(&asts, &mut program).unwrap();

    let dog = program.classes.iter().find(|c| c.name == "Dog").unwrap();
    let animal_id = program.classes.iter().position(|c| c.name == "Animal").unwrap() as i64;
    assert_eq!(dog.base_class_id, Some(animal_id));
}
