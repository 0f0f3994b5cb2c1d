pub mod client;
pub mod server;
pub mod wire;

pub use client::NetworkStore;
pub use server::Simulator;

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::KvStore;

    #[test]
    fn client_roundtrips_against_simulator() {
        let sim = Simulator::bind("127.0.0.1:0").unwrap();
        let addr = sim.local_addr().unwrap();
        thread::spawn(move || sim.serve().unwrap());

        let client = NetworkStore::connect(addr).unwrap();
        assert_eq!(client.get(b"missing").unwrap(), None);

        client.put(b"d:1:a", b"hello").unwrap();
        client.put(b"d:1:b", b"world").unwrap();
        assert_eq!(client.get(b"d:1:a").unwrap(), Some(b"hello".to_vec()));

        let mut it = client.prefix_iter(b"d:1:").unwrap();
        let mut names = Vec::new();
        while it.valid() {
            names.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(names, vec![b"d:1:a".to_vec(), b"d:1:b".to_vec()]);

        client.delete(b"d:1:a").unwrap();
        assert_eq!(client.get(b"d:1:a").unwrap(), None);
        // idempotent delete of missing key
        client.delete(b"d:1:a").unwrap();
    }
}
