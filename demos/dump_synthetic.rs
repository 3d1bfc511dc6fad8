use anyhow;
use clap;
use env_logger;

use flate2::read::MultiGzDecoder;
use itertools::Itertools;
use jvm_hprof_writer::introspect::{
    FieldValue, Frame, PlatformThread, PrimitiveValues, VirtualThreadState,
};
use jvm_hprof_writer::mem_heap::{FieldSpec, InMemoryHeap};
use jvm_hprof_writer::{read, DumpConfig, HeapDumper, Id, IdSize, LineNum};
use rand::{Rng, SeedableRng};
use std::io::Read;
use std::{collections, fs, path};

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let app = clap::App::new("Dump synthetic heap")
        .arg(
            clap::Arg::with_name("output")
                .short("o")
                .long("output")
                .required(true)
                .takes_value(true)
                .help("Heap dump file to write"),
        )
        .arg(
            clap::Arg::with_name("objects")
                .short("n")
                .long("objects")
                .required(false)
                .default_value("100000")
                .takes_value(true)
                .help("Number of objects to allocate in the synthetic heap"),
        )
        .arg(
            clap::Arg::with_name("threads")
                .short("t")
                .long("threads")
                .required(false)
                .takes_value(true)
                .help("Number of dump workers. Defaults to the number of cores."),
        )
        .arg(
            clap::Arg::with_name("gzip")
                .long("gzip")
                .required(false)
                .takes_value(true)
                .help("Compress with the given gzip level (1-9)"),
        )
        .arg(
            clap::Arg::with_name("overwrite")
                .long("overwrite")
                .help("Replace the output file if it exists"),
        )
        .arg(
            clap::Arg::with_name("seed")
                .long("seed")
                .required(false)
                .default_value("0")
                .takes_value(true)
                .help("Seed for the object graph"),
        );
    let matches = app.get_matches();

    let output = matches
        .value_of("output")
        .map(path::Path::new)
        .expect("output must be specified");
    let objects = matches
        .value_of("objects")
        .map(|s| s.parse::<usize>())
        .transpose()?
        .unwrap_or(100_000);
    let seed = matches
        .value_of("seed")
        .map(|s| s.parse::<u64>())
        .transpose()?
        .unwrap_or(0);
    let threads = matches
        .value_of("threads")
        .map(|s| s.parse::<usize>())
        .transpose()?
        .unwrap_or_else(rayon::current_num_threads);
    let gzip = matches
        .value_of("gzip")
        .map(|s| s.parse::<u32>())
        .transpose()?;

    let heap = build_heap(seed, objects);
    let config = DumpConfig::new(output)
        .with_parallelism(threads)
        .with_compression_level(gzip)
        .with_overwrite(matches.is_present("overwrite"));

    let outcome = HeapDumper::new(&heap, config).dump()?;
    println!(
        "Wrote {} objects ({} bytes) with {} worker(s) to {}",
        outcome.objects(),
        outcome.bytes_written(),
        outcome.workers(),
        outcome.path().display()
    );

    record_counts(outcome.path())
}

/// A linked structure of nodes, some arrays, and a few threads with stacks referencing them
fn build_heap(seed: u64, objects: usize) -> InMemoryHeap {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut heap = InMemoryHeap::new(IdSize::U64);
    let object = heap.object_class();

    let node = heap.define_class(
        "demo/Node",
        Some(object),
        &[
            FieldSpec::instance("id", "J"),
            FieldSpec::instance("score", "D"),
            FieldSpec::instance("next", "Ldemo/Node;"),
            FieldSpec::instance("payload", "[B"),
            FieldSpec::static_field("head", "Ldemo/Node;"),
        ],
    );
    heap.set_source_file(node, "Node.java");

    let mut nodes: Vec<Id> = Vec::with_capacity(objects);
    for i in 0..objects {
        let next = nodes.last().copied().unwrap_or(Id::NULL);
        let payload = if rng.gen_bool(0.25) {
            let len = rng.gen_range(0..256);
            let bytes = (0..len).map(|_| rng.gen::<i8>()).collect::<Vec<_>>();
            heap.new_primitive_array(PrimitiveValues::Byte(bytes.into()))
        } else {
            Id::NULL
        };
        let id = heap.new_instance(
            node,
            &[
                ("id", FieldValue::Long(i as i64)),
                ("score", FieldValue::Double(rng.gen())),
                ("next", FieldValue::Object(next)),
                ("payload", FieldValue::Object(payload)),
            ],
        );
        nodes.push(id);
    }
    if let Some(head) = nodes.last() {
        heap.set_static(node, "head", FieldValue::Object(*head));
    }

    let buckets = nodes
        .chunks(64)
        .map(|chunk| heap.new_object_array(heap.object_array_class(), chunk))
        .collect::<Vec<_>>();
    for bucket in buckets.iter().step_by(16) {
        heap.add_jni_global(*bucket);
    }

    let visit = heap.method(node, "visit", "(Ldemo/Node;)V", false);
    let hash = heap.method(node, "hash", "()I", true);
    heap.set_line_number(&visit, 12, LineNum::Normal(40));
    let pick = |rng: &mut rand::rngs::StdRng| {
        if nodes.is_empty() {
            Id::NULL
        } else {
            nodes[rng.gen_range(0..nodes.len())]
        }
    };

    for _ in 0..4 {
        let thread_obj = heap.new_thread_object();
        let frames = vec![
            Frame::Native { method: hash },
            Frame::Java {
                method: visit,
                bci: 12,
                locals: vec![pick(&mut rng), pick(&mut rng)],
                expressions: vec![pick(&mut rng)],
            },
        ];
        heap.add_platform_thread(PlatformThread {
            thread_obj: Some(thread_obj),
            exiting: false,
            hidden: false,
            frames,
            active_handles: vec![pick(&mut rng)],
            mounted_virtual_thread: None,
        });
    }

    for _ in 0..8 {
        let local = pick(&mut rng);
        heap.new_virtual_thread(
            VirtualThreadState::Started,
            false,
            vec![Frame::Java {
                method: visit,
                bci: 12,
                locals: vec![local],
                expressions: vec![],
            }],
        );
    }

    heap
}

fn record_counts(path: &path::Path) -> Result<(), anyhow::Error> {
    let raw = fs::read(path)?;
    let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
        let mut plain = Vec::new();
        MultiGzDecoder::new(&raw[..]).read_to_end(&mut plain)?;
        plain
    } else {
        raw
    };

    let hprof = read::parse_hprof(&bytes)
        .map_err(|e| anyhow::anyhow!("Could not parse header: {:?}", e.map(|(_, kind)| kind)))?;

    let mut record_counts = collections::HashMap::new();
    let mut sub_record_counts = collections::HashMap::new();
    for record in hprof.records_iter() {
        let record = record.map_err(|e| anyhow::anyhow!("Bad record: {:?}", e.map(|(_, kind)| kind)))?;
        *record_counts.entry(record.tag()).or_insert(0_u64) += 1;

        if let Some(segment) = record.as_heap_dump_segment() {
            for sub in segment.sub_records() {
                let sub = sub.map_err(|e| {
                    anyhow::anyhow!("Bad sub-record: {:?}", e.map(|(_, kind)| kind))
                })?;
                *sub_record_counts.entry(sub.tag()).or_insert(0_u64) += 1;
            }
        }
    }

    for (tag, count) in record_counts
        .into_iter()
        .sorted_by_key(|&(tag, _)| tag.tag_byte())
    {
        println!("{:?}: {}", tag, count);
    }
    for (tag, count) in sub_record_counts
        .into_iter()
        .sorted_by_key(|&(tag, _)| tag.tag_byte())
    {
        println!("  {:?}: {}", tag, count);
    }

    Ok(())
}
