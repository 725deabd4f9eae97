use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cancelio::{Client, Server};

#[test]
fn happy_path_concurrent_clients_each_get_their_delay_plus_one() {
    let server = Arc::new(Server::new(30));
    assert!(server.start(18080));

    let mut handles = Vec::new();
    for i in 0..30u64 {
        handles.push(thread::spawn(move || {
            let client = Client::new(Duration::from_secs(5));
            let mut delay = Duration::from_millis(200 + i);
            let ok = client.send_delay(&mut delay, "127.0.0.1", 18080);
            (ok, delay)
        }));
    }

    for (i, h) in handles.into_iter().enumerate() {
        let (ok, delay) = h.join().unwrap();
        assert!(ok);
        assert_eq!(delay, Duration::from_millis(200 + i as u64 + 1));
    }

    // Handlers decrement and notify on their own close-and-notify path, so
    // give the last one a moment to finish before asserting the count.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.current_client_count(), 0);

    server.stop();
}

#[test]
fn admission_cap_is_respected_and_stop_releases_the_waiting_client() {
    let server = Arc::new(Server::new(1));
    assert!(server.start(18081));

    let occupying_client = Arc::new(Client::new(Duration::from_secs(120)));
    let occ = Arc::clone(&occupying_client);
    let occupier = thread::spawn(move || {
        let mut delay = Duration::from_millis(90_000);
        occ.send_delay(&mut delay, "127.0.0.1", 18081)
    });

    thread::sleep(Duration::from_millis(150));
    assert_eq!(server.current_client_count(), 1);

    occupying_client.stop();
    assert!(!occupier.join().unwrap());

    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.current_client_count(), 0);

    server.stop();
}

#[test]
fn server_only_stop_drains_every_handler_without_client_side_stops() {
    let server = Arc::new(Server::new(8));
    assert!(server.start(18082));

    let mut handles = Vec::new();
    for _ in 0..8u32 {
        handles.push(thread::spawn(move || {
            let client = Client::new(Duration::from_secs(30));
            let mut delay = Duration::from_secs(900);
            client.send_delay(&mut delay, "127.0.0.1", 18082)
        }));
    }

    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.current_client_count(), 8);

    server.stop();

    for h in handles {
        assert!(!h.join().unwrap());
    }
}

#[test]
fn stopping_every_occupying_client_then_the_server_drains_within_the_bound() {
    let server = Arc::new(Server::new(8));
    assert!(server.start(18090));

    let clients: Vec<Arc<Client>> =
        (0..8).map(|_| Arc::new(Client::new(Duration::from_secs(900)))).collect();

    let mut handles = Vec::new();
    for client in &clients {
        let client = Arc::clone(client);
        handles.push(thread::spawn(move || {
            let mut delay = Duration::from_secs(900_000);
            client.send_delay(&mut delay, "127.0.0.1", 18090)
        }));
    }

    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.current_client_count(), 8);

    let start = std::time::Instant::now();
    for client in &clients {
        client.stop();
    }
    server.stop();
    let elapsed = start.elapsed();

    for h in handles {
        assert!(!h.join().unwrap());
    }
    assert_eq!(server.current_client_count(), 0);
    assert!(elapsed < Duration::from_secs(4), "stop sequence took {elapsed:?}");
}

#[test]
fn a_timed_out_client_never_admitted_returns_false() {
    let server = Arc::new(Server::new(1));
    assert!(server.start(18083));

    let occupying_client = Arc::new(Client::new(Duration::from_secs(30)));
    let occ = Arc::clone(&occupying_client);
    let _occupier = thread::spawn(move || {
        let mut delay = Duration::from_secs(30);
        occ.send_delay(&mut delay, "127.0.0.1", 18083)
    });
    thread::sleep(Duration::from_millis(100));

    let second = Client::new(Duration::from_millis(200));
    let mut delay = Duration::from_millis(1);
    assert!(!second.send_delay(&mut delay, "127.0.0.1", 18083));

    occupying_client.stop();
    server.stop();
}

#[test]
fn two_servers_can_be_reached_by_the_same_client_concurrently() {
    let server_a = Server::new(4);
    let server_b = Server::new(4);
    assert!(server_a.start(18084));
    assert!(server_b.start(18085));

    let client = Arc::new(Client::new(Duration::from_secs(5)));

    let a = {
        let client = Arc::clone(&client);
        thread::spawn(move || {
            let mut delay = Duration::from_millis(50);
            let ok = client.send_delay(&mut delay, "127.0.0.1", 18084);
            (ok, delay)
        })
    };
    let b = {
        let client = Arc::clone(&client);
        thread::spawn(move || {
            let mut delay = Duration::from_millis(51);
            let ok = client.send_delay(&mut delay, "127.0.0.1", 18085);
            (ok, delay)
        })
    };

    let (ok_a, delay_a) = a.join().unwrap();
    let (ok_b, delay_b) = b.join().unwrap();
    assert!(ok_a);
    assert!(ok_b);
    assert_eq!(delay_a, Duration::from_millis(51));
    assert_eq!(delay_b, Duration::from_millis(52));

    server_a.stop();
    server_b.stop();
}

#[test]
fn stopping_a_client_twice_is_harmless() {
    let client = Client::new(Duration::from_millis(50));
    client.stop();
    client.stop();
}

#[test]
fn stopping_a_never_started_server_is_harmless() {
    let server = Server::new(4);
    server.stop();
    server.stop();
}
