//! End-to-end scenario tests: full programs through Context::execute with a
//! captured print sink.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Result, bail, ensure};
use indoc::indoc;
use pyrite::{Config, Context};

fn context_with_capture() -> (Context, Rc<RefCell<String>>) {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = output.clone();
    let mut config = Config::default();
    config.print = Box::new(move |text| sink.borrow_mut().push_str(text));
    (Context::new(config), output)
}

fn run(source: &str) -> Result<String> {
    let (mut ctx, output) = context_with_capture();
    if ctx.execute(source, "<test>").is_err() {
        bail!("{}", ctx.error_message());
    }
    let captured = output.borrow().clone();
    Ok(captured)
}

fn run_error(source: &str) -> String {
    let (mut ctx, _output) = context_with_capture();
    assert!(
        ctx.execute(source, "<test>").is_err(),
        "expected program to raise"
    );
    ctx.error_message()
}

#[test]
fn prints_arithmetic_result() -> Result<()> {
    assert_eq!(run("print(1+2)\n")?, "3\n");
    Ok(())
}

#[test]
fn runs_recursive_factorial() -> Result<()> {
    let output = run(indoc! {"
        def fact(n):
            return 1 if n <= 1 else n * fact(n-1)
        print(fact(10))
    "})?;
    assert_eq!(output, "3628800\n");
    Ok(())
}

#[test]
fn handles_except_and_finally() -> Result<()> {
    let output = run(indoc! {r#"
        try:
            raise ValueError("x")
        except ValueError as e:
            print(e.message if hasattr(e, "message") else e)
        finally:
            print("done")
    "#})?;
    assert_eq!(output, "x\ndone\n");
    Ok(())
}

#[test]
fn closure_counter_shares_the_cell() -> Result<()> {
    let output = run(indoc! {"
        def make():
            x = 0
            def inc():
                nonlocal x
                x = x + 1
                return x
            return inc
        f = make()
        print(f())
        print(f())
        print(f())
    "})?;
    assert_eq!(output, "1\n2\n3\n");
    Ok(())
}

#[test]
fn for_else_is_skipped_on_break() -> Result<()> {
    let output = run(indoc! {r#"
        for i in range(5):
            if i == 3:
                break
            print(i)
        else:
            print("no-break")
        print("after")
    "#})?;
    assert_eq!(output, "0\n1\n2\nafter\n");
    Ok(())
}

#[test]
fn for_else_runs_without_break() -> Result<()> {
    let output = run(indoc! {r#"
        for i in range(2):
            print(i)
        else:
            print("no-break")
    "#})?;
    assert_eq!(output, "0\n1\nno-break\n");
    Ok(())
}

#[test]
fn method_calls_explicit_base_method() -> Result<()> {
    let output = run(indoc! {r#"
        class A:
            def f(self):
                return "A"
        class B(A):
            def f(self):
                return "B-" + A.f(self)
        print(B().f())
    "#})?;
    assert_eq!(output, "B-A\n");
    Ok(())
}

#[test]
fn multiple_inheritance_resolves_depth_first() -> Result<()> {
    let output = run(indoc! {r#"
        class A:
            def who(self):
                return "A"
        class B:
            def who(self):
                return "B"
            def other(self):
                return "B-other"
        class C(A, B):
            pass
        c = C()
        print(c.who())
        print(c.other())
        print(isinstance(c, A))
        print(isinstance(c, B))
    "#})?;
    assert_eq!(output, "A\nB-other\nTrue\nTrue\n");
    Ok(())
}

#[test]
fn finally_runs_on_return_path() -> Result<()> {
    let output = run(indoc! {r#"
        def f():
            try:
                return "value"
            finally:
                print("cleanup")
        print(f())
    "#})?;
    assert_eq!(output, "cleanup\nvalue\n");
    Ok(())
}

#[test]
fn break_through_nested_finally_blocks_runs_each_once() -> Result<()> {
    let output = run(indoc! {r#"
        while True:
            try:
                try:
                    break
                finally:
                    print("inner")
            finally:
                print("outer")
        print("after")
    "#})?;
    assert_eq!(output, "inner\nouter\nafter\n");
    Ok(())
}

#[test]
fn unmatched_exception_still_runs_finally() -> Result<()> {
    let output = run(indoc! {r#"
        def f():
            try:
                raise KeyError("k")
            finally:
                print("cleanup")
        try:
            f()
        except KeyError:
            print("caught")
    "#})?;
    assert_eq!(output, "cleanup\ncaught\n");
    Ok(())
}

#[test]
fn exception_propagates_through_call_stack() -> Result<()> {
    let output = run(indoc! {r#"
        def inner():
            raise ValueError("deep")
        def outer():
            inner()
        try:
            outer()
        except ValueError as e:
            print("caught", e)
    "#})?;
    assert_eq!(output, "caught deep\n");
    Ok(())
}

#[test]
fn except_matches_base_classes() -> Result<()> {
    let output = run(indoc! {r#"
        try:
            xs = []
            xs[3]
        except LookupError:
            print("lookup")
    "#})?;
    assert_eq!(output, "lookup\n");
    Ok(())
}

#[test]
fn bare_except_catches_everything() -> Result<()> {
    let output = run(indoc! {r#"
        try:
            1 // 0
        except ZeroDivisionError:
            print("zero")
        except:
            print("other")
    "#})?;
    assert_eq!(output, "zero\n");
    Ok(())
}

#[test]
fn user_exception_classes_are_raisable() -> Result<()> {
    let output = run(indoc! {r#"
        class AppError(Exception):
            pass
        try:
            raise AppError("boom")
        except AppError as e:
            print("caught", e)
        except Exception:
            print("wrong handler")
    "#})?;
    assert_eq!(output, "caught boom\n");
    Ok(())
}

#[test]
fn default_and_keyword_arguments_bind() -> Result<()> {
    let output = run(indoc! {r#"
        def greet(name, greeting="hello", punct="!"):
            return greeting + " " + name + punct
        print(greet("ada"))
        print(greet("ada", punct="?"))
        print(greet(greeting="hi", name="bob"))
    "#})?;
    assert_eq!(output, "hello ada!\nhello ada?\nhi bob!\n");
    Ok(())
}

#[test]
fn variadic_and_keyword_rest_parameters_collect() -> Result<()> {
    let output = run(indoc! {r#"
        def f(first, *rest, **options):
            print(first)
            print(rest)
            print(options["mode"])
        f(1, 2, 3, mode="fast")
    "#})?;
    assert_eq!(output, "1\n(2, 3)\nfast\n");
    Ok(())
}

#[test]
fn call_site_unpacking_spreads_arguments() -> Result<()> {
    let output = run(indoc! {r#"
        def add3(a, b, c):
            return a + b + c
        args = [1, 2, 3]
        print(add3(*args))
        options = {"b": 20, "c": 30}
        print(add3(10, **options))
    "#})?;
    assert_eq!(output, "6\n60\n");
    Ok(())
}

#[test]
fn tuple_assignment_unpacks_with_star() -> Result<()> {
    let output = run(indoc! {"
        a, b = 1, 2
        print(a, b)
        first, *middle, last = [1, 2, 3, 4, 5]
        print(first, middle, last)
    "})?;
    assert_eq!(output, "1 2\n1 [2, 3, 4] 5\n");
    Ok(())
}

#[test]
fn compound_assignment_evaluates_target_once() -> Result<()> {
    let output = run(indoc! {r#"
        calls = []
        xs = [10, 20]
        def pick():
            calls.append("picked")
            return xs
        pick()[1] += 5
        print(xs[1])
        print(len(calls))
    "#})?;
    assert_eq!(output, "25\n1\n");
    Ok(())
}

#[test]
fn list_comprehension_with_condition() -> Result<()> {
    let output = run(indoc! {"
        squares = [x * x for x in range(6) if x % 2 == 0]
        print(squares)
    "})?;
    assert_eq!(output, "[0, 4, 16]\n");
    Ok(())
}

#[test]
fn slicing_supports_steps_and_negatives() -> Result<()> {
    let output = run(indoc! {"
        xs = [0, 1, 2, 3, 4, 5]
        print(xs[1:4])
        print(xs[::2])
        print(xs[::-1])
        print('hello'[1:3])
    "})?;
    assert_eq!(output, "[1, 2, 3]\n[0, 2, 4]\n[5, 4, 3, 2, 1, 0]\nel\n");
    Ok(())
}

#[test]
fn dict_and_set_operations() -> Result<()> {
    let output = run(indoc! {r#"
        d = {"a": 1, "b": 2}
        d["c"] = 3
        print(d["a"], d.get("missing", 0))
        print("b" in d)
        total = 0
        for key in d:
            total += d[key]
        print(total)
        s = {1, 2}
        s.add(3)
        print(2 in s, 9 in s)
        print(len(s))
    "#})?;
    assert_eq!(output, "1 0\nTrue\n6\nTrue False\n3\n");
    Ok(())
}

#[test]
fn short_circuit_preserves_decisive_operand() -> Result<()> {
    let output = run(indoc! {"
        print(0 and 5)
        print(2 and 5)
        print(0 or 7)
        print(3 or 7)
        print(not 0)
    "})?;
    assert_eq!(output, "0\n5\n7\n3\nTrue\n");
    Ok(())
}

#[test]
fn is_and_in_operators() -> Result<()> {
    let output = run(indoc! {"
        a = None
        print(a is None)
        print(a is not None)
        xs = [1, 2, 3]
        print(2 in xs)
        print(9 not in xs)
        print('ell' in 'hello')
    "})?;
    assert_eq!(output, "True\nFalse\nTrue\nTrue\nTrue\n");
    Ok(())
}

#[test]
fn lambdas_capture_lexically() -> Result<()> {
    let output = run(indoc! {"
        def adder(n):
            return lambda x: x + n
        add5 = adder(5)
        print(add5(3))
    "})?;
    assert_eq!(output, "8\n");
    Ok(())
}

#[test]
fn global_declaration_writes_module_cell() -> Result<()> {
    let output = run(indoc! {"
        count = 0
        def bump():
            global count
            count = count + 1
        bump()
        bump()
        print(count)
    "})?;
    assert_eq!(output, "2\n");
    Ok(())
}

#[test]
fn while_else_runs_without_break() -> Result<()> {
    let output = run(indoc! {r#"
        i = 0
        while i < 2:
            i += 1
        else:
            print("exhausted")
        print(i)
    "#})?;
    assert_eq!(output, "exhausted\n2\n");
    Ok(())
}

#[test]
fn prelude_helpers_work() -> Result<()> {
    let output = run(indoc! {"
        print(sum([1, 2, 3]))
        print(enumerate(['a', 'b']))
        print(zip([1, 2], ['x', 'y']))
        print(sorted([3, 1, 2]))
        print(reversed([1, 2, 3]))
        print(min(4, 2, 9), max([4, 2, 9]))
    "})?;
    assert_eq!(
        output,
        "6\n[(0, 'a'), (1, 'b')]\n[(1, 'x'), (2, 'y')]\n[1, 2, 3]\n[3, 2, 1]\n2 9\n"
    );
    Ok(())
}

#[test]
fn string_round_trips_through_int_and_float() -> Result<()> {
    let output = run(indoc! {"
        print(int(str(12345)) == 12345)
        print(int(str(-7)) == -7)
        print(float(str(0.5)) == 0.5)
        print(str(3.0))
    "})?;
    assert_eq!(output, "True\nTrue\nTrue\n3.0\n");
    Ok(())
}

#[test]
fn float_and_int_arithmetic_coerce() -> Result<()> {
    let output = run(indoc! {"
        print(7 // 2)
        print(-7 // 2)
        print(7 % 3)
        print(-7 % 3)
        print(1 / 2)
        print(2 ** 10)
        print(2.5 + 1)
        print(1 << 4, 255 >> 4)
        print(6 & 3, 6 | 3, 6 ^ 3, ~0)
    "})?;
    assert_eq!(
        output,
        "3\n-4\n1\n2\n0.5\n1024\n3.5\n16 15\n2 7 5 -1\n"
    );
    Ok(())
}

#[test]
fn len_delegates_to_dunder() -> Result<()> {
    let output = run(indoc! {"
        class Box:
            def __len__(self):
                return 7
        print(len(Box()))
        print(len('abc'), len([1, 2]), len((1,)), len({'a': 1}))
    "})?;
    assert_eq!(output, "7\n3 2 1 1\n");
    Ok(())
}

#[test]
fn operator_dunders_dispatch_on_user_classes() -> Result<()> {
    let output = run(indoc! {r#"
        class Vec:
            def __init__(self, x, y):
                self.x = x
                self.y = y
            def __add__(self, other):
                return Vec(self.x + other.x, self.y + other.y)
            def __eq__(self, other):
                return self.x == other.x and self.y == other.y
            def __str__(self):
                return "Vec(" + str(self.x) + ", " + str(self.y) + ")"
        a = Vec(1, 2)
        b = Vec(3, 4)
        print(a + b)
        print(a == Vec(1, 2))
    "#})?;
    assert_eq!(output, "Vec(4, 6)\nTrue\n");
    Ok(())
}

#[test]
fn iterator_protocol_drives_user_iterables() -> Result<()> {
    let output = run(indoc! {"
        class Countdown:
            def __init__(self, n):
                self.n = n
            def __iter__(self):
                return self
            def __next__(self):
                if self.n <= 0:
                    raise StopIteration()
                value = self.n
                self.n = self.n - 1
                return value
        print([x for x in Countdown(3)])
    "})?;
    assert_eq!(output, "[3, 2, 1]\n");
    Ok(())
}

#[test]
fn imports_native_math_module() -> Result<()> {
    let output = run(indoc! {"
        import math
        print(math.floor(2.7))
        from math import sqrt
        print(sqrt(16.0))
    "})?;
    assert_eq!(output, "2\n4.0\n");
    Ok(())
}

// ----- boundary behaviors -----

#[test]
fn division_by_zero_raises_for_every_operator() {
    for source in ["1 / 0\n", "1 // 0\n", "1 % 0\n", "1.5 / 0.0\n"] {
        let message = run_error(source);
        assert!(
            message.contains("ZeroDivisionError"),
            "expected ZeroDivisionError for {source}, got {message}"
        );
    }
}

#[test]
fn negative_shift_raises_value_error() {
    let message = run_error("1 << -1\n");
    assert!(message.contains("ValueError"));
}

#[test]
fn slice_step_zero_raises_value_error() {
    let message = run_error("[1, 2, 3][::0]\n");
    assert!(message.contains("ValueError"));
}

#[test]
fn index_out_of_range_raises_index_error() {
    let message = run_error("[1, 2][5]\n");
    assert!(message.contains("IndexError"));
}

#[test]
fn missing_name_raises_name_error() {
    let message = run_error("print(missing)\n");
    assert!(message.contains("NameError"));
}

#[test]
fn missing_attribute_raises_attribute_error() {
    let message = run_error("(1).missing\n");
    assert!(message.contains("AttributeError"));
}

#[test]
fn missing_dict_key_raises_key_error() {
    let message = run_error("{'a': 1}['b']\n");
    assert!(message.contains("KeyError"));
}

#[test]
fn unknown_import_raises_import_error() {
    let message = run_error("import does_not_exist\n");
    assert!(message.contains("ImportError"));
    assert!(message.contains("does_not_exist"));
}

#[test]
fn syntax_errors_surface_as_exceptions() {
    let message = run_error("def broken(:\n    pass\n");
    assert!(message.contains("SyntaxError"));
}

#[test]
fn recursion_limit_raises_recursion_error() {
    let message = run_error(indoc! {"
        def loop():
            return loop()
        loop()
    "});
    assert!(message.contains("RecursionError"));
}

#[test]
fn traceback_names_module_and_line() {
    let message = run_error(indoc! {"
        x = 1
        raise ValueError('why')
    "});
    assert!(message.starts_with("Traceback (most recent call last):"));
    assert!(message.contains("Module __main__"));
    assert!(message.contains("Line 2"));
    assert!(message.contains("ValueError: why"));
}

#[test]
fn uncaught_exception_leaves_context_inspectable() -> Result<()> {
    let (mut ctx, _output) = context_with_capture();
    ensure!(ctx.execute("raise ValueError('gone')\n", "<test>").is_err());
    ensure!(ctx.current_exception().is_some());
    ctx.clear_current_exception();
    ensure!(ctx.current_exception().is_none());
    ensure!(ctx.error_message() == "Ok");
    Ok(())
}

#[test]
fn host_call_reenters_compiled_function() -> Result<()> {
    let (mut ctx, output) = context_with_capture();
    ensure!(
        ctx.execute(
            indoc! {"
                def shout(word):
                    print(word + '!')
            "},
            "<test>",
        )
        .is_ok()
    );
    let function = ctx
        .get_global("shout")
        .ok_or_else(|| anyhow::anyhow!("missing global"))?;
    let word = ctx.new_string("hey")?;
    ensure!(ctx.call(function, &[word], None).is_ok());
    ensure!(output.borrow().as_str() == "hey!\n");
    Ok(())
}

#[test]
fn garbage_collection_preserves_live_cycles() -> Result<()> {
    let output = run(indoc! {"
        class Node:
            def __init__(self):
                self.next = None
        i = 0
        while i < 200:
            a = Node()
            b = Node()
            a.next = b
            b.next = a
            i += 1
        keep = Node()
        keep.next = keep
        print('alive')
    "})?;
    assert_eq!(output, "alive\n");
    Ok(())
}

#[test]
fn collect_garbage_is_safe_between_calls() -> Result<()> {
    let (mut ctx, _output) = context_with_capture();
    ensure!(ctx.execute("xs = [1, 2, 3]\n", "<test>").is_ok());
    ctx.collect_garbage();
    let xs = ctx
        .get_global("xs")
        .ok_or_else(|| anyhow::anyhow!("missing global"))?;
    ensure!(ctx.is_list(xs));
    Ok(())
}

#[test]
fn execute_expression_returns_the_value() -> Result<()> {
    let (mut ctx, _output) = context_with_capture();
    let result = ctx.execute_expression("2 ** 8", "<expr>");
    let Ok(value) = result else {
        bail!("{}", ctx.error_message());
    };
    ensure!(ctx.is_int(value));
    ensure!(ctx.get_int(value) == 256);
    Ok(())
}
