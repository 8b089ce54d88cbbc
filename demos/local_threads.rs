use simple_dispatch::comm::{Communicator, LocalWorld, RequestSet};
use simple_dispatch::session::{run_session, SessionOutcome};

fn main() {
    env_logger::init();

    // Example 1: Send/Receive between two threads of one group
    LocalWorld::run(2, |world| {
        if world.rank() == 0 {
            let message = format!("Hello from rank {}", world.rank());
            world.send(&message, 1, 0).unwrap();
        } else {
            let message: String = world.recv(0, 0).unwrap();
            println!("Rank {} received message: {}", world.rank(), message);
        }
    })
    .unwrap();

    // Example 2: Wait for whichever rank answers first
    LocalWorld::run(4, |world| {
        if world.rank() == 0 {
            let mut requests = RequestSet::new(3);
            for rank in 1..world.size() {
                requests.post(rank as usize - 1, rank, 0).unwrap();
            }
            while let Some((idx, value)) = world.wait_any::<i32>(&mut requests).unwrap() {
                println!("Request {} completed with {}", idx, value);
            }
        } else {
            world.send(&(world.rank() * 100), 0, 0).unwrap();
        }
    })
    .unwrap();

    // Example 3: A full dispatch run
    let outcomes = LocalWorld::run(5, |world| run_session(world, 200, 1)).unwrap();
    for outcome in outcomes {
        match outcome.unwrap() {
            SessionOutcome::Coordinator(report) => println!("{}", report),
            SessionOutcome::Worker(run) => println!(
                "Rank {} worked tickets {:?}..",
                run.summary.rank,
                run.tickets.iter().take(3).map(|t| t.id()).collect::<Vec<_>>()
            ),
        }
    }
}
