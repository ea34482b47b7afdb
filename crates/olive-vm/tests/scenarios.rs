//! End-to-end scenarios: source text through the real compiler and into a
//! fresh `Vm`, asserting on the exact lines `PRINT` produced. Grounded on
//! `spec.md` §8's end-to-end scenario list — each test below is one of
//! those scenarios, transcribed verbatim as the program source.

use std::cell::RefCell;
use std::rc::Rc;

use olive_vm::{Host, Vm};

struct RecordingHost {
    lines: Rc<RefCell<Vec<String>>>,
}

impl Host for RecordingHost {
    fn print(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

fn run(source: &str) -> Vec<String> {
    let lines = Rc::new(RefCell::new(Vec::new()));
    let host = RecordingHost { lines: lines.clone() };
    let mut vm = Vm::with_host(false, Box::new(host));
    let function = olive_compiler::compile(source, vm.heap_mut()).expect("program should compile");
    vm.interpret(function).expect("program should run without a runtime error");
    lines.borrow().clone()
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), vec!["7"]);
}

#[test]
fn for_loop_accumulation() {
    assert_eq!(run("var x = 0; for (var i = 0; i < 5; i = i + 1) { x = x + i; } print x;"), vec!["10"]);
}

#[test]
fn closures_share_and_close_over_their_upvalue() {
    let source = "def make() { var n = 0; def inc() { n = n + 1; return n; } return inc; } \
                  var f = make(); print f(); print f(); print f();";
    assert_eq!(run(source), vec!["1", "2", "3"]);
}

#[test]
fn base_method_call_chains_into_the_override() {
    let source = "class A { greet() { print \"hi\"; } } \
                  class B : A { greet() { base.greet(); print \"from B\"; } } \
                  B().greet();";
    assert_eq!(run(source), vec!["hi", "from B"]);
}

#[test]
fn string_interpolation_evaluates_the_embedded_expression() {
    let source = "var s = \"n=${1+2}\"; print s;";
    assert_eq!(run(source), vec!["n=3"]);
}

#[test]
fn switch_fallthrough_runs_every_case_until_a_break() {
    let source = "switch (2) { case 1: print \"a\"; case 2: print \"b\"; case 3: print \"c\"; break; default: print \"d\"; }";
    assert_eq!(run(source), vec!["b", "c"]);
}

#[test]
fn stack_overflow_past_frames_max_is_a_runtime_error_not_a_panic() {
    let source = "def recurse(n) { return recurse(n + 1); } recurse(0);";
    let mut vm = Vm::new();
    let function = olive_compiler::compile(source, vm.heap_mut()).expect("program should compile");
    let err = vm.interpret(function).expect_err("unbounded recursion should be a runtime error");
    assert!(err.message.contains("Stack overflow"));
}
