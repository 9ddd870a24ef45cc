use odrive_crypto::{generate_content_key, generate_iv, wrap_key, MasterKey};
use secrecy::SecretString;

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let key = generate_content_key();
    let iv = generate_iv();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            runtime.block_on(async {
                let mut out = Vec::with_capacity(size);
                odrive_crypto::encrypt(
                    divan::black_box(data.as_slice()),
                    &mut out,
                    &key,
                    &iv,
                )
                .await
                .unwrap()
            })
        });
}

#[divan::bench]
fn bench_wrap_key(bencher: divan::Bencher) {
    let master = MasterKey::new(SecretString::from("bench-master".to_string())).unwrap();
    let key = generate_content_key();
    bencher.bench(|| {
        wrap_key(
            &master,
            divan::black_box("CN=bench user, OU=People, O=Org, C=US"),
            &key,
        )
    });
}

fn main() {
    divan::main();
}
