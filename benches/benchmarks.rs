//! Performance benchmarks for meshnode-agent
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshnode_agent::config::NodeConfig;
use meshnode_agent::security::validate_interface_name;
use meshnode_agent::state::{diff, Peer, StateResponse};
use meshnode_agent::wireguard::{KeyPair, PrivateKey};

fn bench_key_generation(c: &mut Criterion) {
    c.bench_function("key_generation", |b| {
        b.iter(|| {
            let _key = PrivateKey::generate();
        });
    });
}

fn bench_public_key_derivation(c: &mut Criterion) {
    let private_key = PrivateKey::generate();

    c.bench_function("public_key_derivation", |b| {
        b.iter(|| {
            let _public = black_box(&private_key).public_key();
        });
    });
}

fn bench_config_parsing(c: &mut Criterion) {
    let toml_data = r#"
node_id = "node-a"
control_plane_url = "https://mesh.example.com"

[wireguard]
interface = "wg-mesh0"
private_key_path = "/etc/meshnode-agent/private.key"
listen_port = 51820
mesh_address = "10.10.0.5/24"
mtu = 1420
persistent_keepalive_secs = 25
"#;

    c.bench_function("config_parsing_toml", |b| {
        b.iter(|| {
            let _config: NodeConfig = toml::from_str(black_box(toml_data)).unwrap();
        });
    });
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");

    group.bench_function("interface_name_valid", |b| {
        b.iter(|| {
            let _ = validate_interface_name(black_box("wg-mesh0"));
        });
    });

    group.finish();
}

fn peer(id: &str) -> Peer {
    Peer {
        id: id.to_string(),
        public_key: format!("key-{}", id),
        mesh_ip: "10.10.0.2".to_string(),
        endpoint: "1.2.3.4:51820".to_string(),
        allowed_ips: vec![],
        preshared_key: None,
    }
}

fn bench_state_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_diff");

    for peer_count in [1, 10, 50, 200].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(peer_count), peer_count, |b, &count| {
            let previous = StateResponse {
                peers: (0..count).map(|i| peer(&format!("peer{}", i))).collect(),
                ..Default::default()
            };
            let mut current = previous.clone();
            current.peers.push(peer("peer-new"));

            b.iter(|| {
                let _d = diff(black_box(&previous), black_box(&current));
            });
        });
    }

    group.finish();
}

fn bench_keypair_roundtrip(c: &mut Criterion) {
    c.bench_function("keypair_to_base64", |b| {
        let keypair = KeyPair::generate();
        b.iter(|| {
            let _ = black_box(&keypair.private).to_base64();
        });
    });
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_public_key_derivation,
    bench_config_parsing,
    bench_validation,
    bench_state_diff,
    bench_keypair_roundtrip,
);

criterion_main!(benches);
