use std::{process::ExitCode, sync::Arc};

use clap::Parser as ClapParser;
use log::{LevelFilter, debug, error, info};
use pyabi::{
    Address, ContextCreateInfo, Delegate, HostObject, Interned, NativeContext, NativeWrapper,
    ObjectWrapper, TypeFlags,
};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::IndexedRandom};

#[derive(ClapParser)]
#[command(about = "Drive the native object bridge with random gc list traffic")]
struct Cli {
    /// Objects escaped before the first round
    #[arg(long, default_value_t = 64, help = "Number of objects to escape")]
    objects: usize,

    #[arg(long, default_value_t = 16, help = "Number of randomized rounds")]
    rounds: usize,

    #[arg(long, help = "Seed for the random rounds")]
    seed: Option<u64>,

    #[arg(long, help = "Log every list mutation and table operation")]
    verbose: bool,
}

const DEMO_TYPE: Address = Address::new(0x10_0000);
const INT_TYPE: Address = Address::new(0x10_1000);

#[derive(Debug)]
struct DemoObject {
    referents: Vec<Delegate>,
    small_int: Option<i64>,
}

impl DemoObject {
    fn object(referents: Vec<Delegate>) -> Delegate {
        Arc::new(Self {
            referents,
            small_int: None,
        })
    }

    fn small_int(value: i64) -> Delegate {
        Arc::new(Self {
            referents: Vec::new(),
            small_int: Some(value),
        })
    }
}

impl HostObject for DemoObject {
    fn type_pointer(&self) -> Address {
        match self.small_int {
            Some(_) => INT_TYPE,
            None => DEMO_TYPE,
        }
    }

    fn type_flags(&self) -> TypeFlags {
        match self.small_int {
            Some(_) => TypeFlags::READY,
            None => TypeFlags::READY | TypeFlags::HEAPTYPE | TypeFlags::HAVE_GC,
        }
    }

    fn referents(&self) -> Vec<Delegate> {
        self.referents.clone()
    }

    fn interned(&self) -> Option<Interned> {
        self.small_int.map(Interned::SmallInt)
    }
}

/// A managed object the demo still holds, with its wrapper
type Live = (Delegate, Arc<ObjectWrapper>);

fn escape_objects(
    ctx: &NativeContext,
    rng: &mut StdRng,
    count: usize,
    first_id: usize,
) -> Vec<Live> {
    let mut live: Vec<Live> = Vec::with_capacity(count);
    for id in first_id..first_id + count {
        let referents = match live.len() >= 2 && rng.random_bool(0.25) {
            true => {
                let mut referents: Vec<Delegate> = live
                    .choose_multiple(rng, 2)
                    .map(|(delegate, _)| delegate.clone())
                    .collect();
                referents.push(DemoObject::small_int(rng.random_range(-5..=256)));
                referents
            }
            false => Vec::new(),
        };
        let delegate = DemoObject::object(referents);
        let wrapper = ctx.wrap(&delegate);
        let pointer = ctx.to_native(&wrapper);
        debug!("demo object {id} escaped to {pointer:?}");
        live.push((delegate, wrapper));
    }
    live
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.verbose {
        builder.filter_level(LevelFilter::Trace);
    }
    builder.init();

    let ctx = match NativeContext::new(ContextCreateInfo::default()) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    ctx.with_gil(|state| state.init_small_ints(DemoObject::small_int));

    let seed = cli.seed.unwrap_or_else(|| rand::rng().random());
    info!("seed {seed}");
    let mut rng = StdRng::seed_from_u64(seed);

    let mut live = escape_objects(&ctx, &mut rng, cli.objects, 0);
    let mut next_id = cli.objects;

    for round in 0..cli.rounds {
        let operations = live.len().max(1) * 2;
        for _ in 0..operations {
            let Some(index) = (!live.is_empty()).then(|| rng.random_range(0..live.len())) else {
                break;
            };
            let Some(pointer) = live[index].1.native_pointer() else {
                continue;
            };
            let stub = pointer.to_stub();
            match rng.random_range(0..8) {
                0..=2 => ctx.track(stub),
                3..=5 => {
                    ctx.untrack(stub);
                }
                6 => {
                    ctx.inc_ref(&live[index].1);
                }
                _ => {
                    // managed side lets go, native references decide what survives
                    let (_, wrapper) = live.swap_remove(index);
                    if ctx.with_gil(|state| state.refcount(&wrapper)) > pyabi::MANAGED_REFCNT {
                        ctx.dec_ref(&wrapper);
                    }
                }
            }
        }

        let released = ctx.poll_reference_queue();
        let fresh = rng.random_range(0..=cli.objects / 4);
        live.extend(escape_objects(&ctx, &mut rng, fresh, next_id));
        next_id += fresh;

        let validated = ctx.with_gil(|state| {
            let gc = state.gc();
            gc.validate_list(gc.generation0())
                .map(|tracked| (tracked, gc.count(0), gc.collection_due()))
        });
        match validated {
            Ok((tracked, count, due)) => info!(
                "round {round}: {} live, {tracked} tracked, gen0 count {count}, released {released}{}",
                live.len(),
                if due { ", collection due" } else { "" }
            ),
            Err(err) => {
                error!("round {round}: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    drop(live);
    let released = ctx.poll_reference_queue();
    let counters = ctx.counters();
    println!("released at shutdown: {released}");
    println!("escaped:              {}", counters.escaped);
    println!("deallocated:          {}", counters.deallocated);
    println!(
        "still escaped:        {}",
        ctx.with_gil(|state| state.escaped_count())
    );
    ExitCode::SUCCESS
}
