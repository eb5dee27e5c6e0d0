use criterion::{Criterion, black_box, criterion_group, criterion_main};
use pyrite::{Config, Context, lexer, parser};

const WORKLOADS: [(&str, &str); 3] = [
    (
        "fact",
        "def fact(n):\n    return 1 if n <= 1 else n * fact(n-1)\nfact(15)\n",
    ),
    (
        "loop_sum",
        "total = 0\nfor i in range(2000):\n    total += i\n",
    ),
    (
        "attr_dispatch",
        "class Counter:\n    def __init__(self):\n        self.n = 0\n    def bump(self):\n        self.n = self.n + 1\nc = Counter()\nfor i in range(500):\n    c.bump()\n",
    ),
];

fn quiet_context() -> Context {
    let mut config = Config::default();
    config.max_recursion = 200;
    config.print = Box::new(|_text| {});
    Context::new(config)
}

fn bench_frontend(c: &mut Criterion) {
    for (label, source) in WORKLOADS {
        c.bench_function(&format!("frontend_tokenize_parse_{label}"), |b| {
            b.iter(|| {
                let tokens = lexer::tokenize(black_box(source)).expect("tokenize");
                let program = parser::parse_tokens(tokens).expect("parse");
                black_box(program);
            })
        });
    }
}

fn bench_compile(c: &mut Criterion) {
    for (label, source) in WORKLOADS {
        let mut ctx = quiet_context();
        c.bench_function(&format!("compile_only_{label}"), |b| {
            b.iter(|| {
                let function = ctx
                    .compile(black_box(source), "<bench>")
                    .expect("compile");
                black_box(function);
            })
        });
    }
}

fn bench_execute(c: &mut Criterion) {
    for (label, source) in WORKLOADS {
        let mut ctx = quiet_context();
        let function = ctx.compile(source, "<bench>").expect("compile");
        ctx.protect(function);

        c.bench_function(&format!("run_compiled_{label}"), |b| {
            b.iter(|| {
                let result = ctx.call(black_box(function), &[], None).expect("run");
                black_box(result);
            })
        });

        c.bench_function(&format!("compile_plus_run_{label}"), |b| {
            b.iter(|| {
                let result = ctx.execute(black_box(source), "<bench>").expect("run");
                black_box(result);
            })
        });
    }
}

criterion_group!(benches, bench_frontend, bench_compile, bench_execute);
criterion_main!(benches);
