use async_trait::async_trait;
use chamados_consumer::{
    process_delivery, Acknowledger, ConsumerRole, Disposition, ForcedFailure, SqliteTicketStore, Ticket,
    TicketHandler, TicketStore, WorkerError,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const SAMPLE: &str = r#"{"Titulo":"Troca de filtro","Descricao":"Filtro sujo","TipoManutencao":1,"Criticidade":2,"Tecnico":"Ana","DataAbertura":"2024-01-10T08:00:00Z","DataFechamento":null,"Status":1,"Equipamento":"Bomba-02","Localizacao":"Setor A","Modelo":"X100"}"#;

/// Stands in for the broker: a main queue whose rejected messages fan out to a
/// dead-letter queue, and a dead-letter queue whose rejected messages are dropped.
#[derive(Default)]
struct FakeBroker {
    main: Mutex<VecDeque<Vec<u8>>>,
    dead_letter: Mutex<VecDeque<Vec<u8>>>,
    dropped: Mutex<Vec<Vec<u8>>>,
}

struct FakeDelivery<'a> {
    broker: &'a FakeBroker,
    role: ConsumerRole,
    body: Vec<u8>,
    settlements: Mutex<u32>,
}

#[async_trait]
impl Acknowledger for FakeDelivery<'_> {
    async fn acknowledge(&self) -> Result<(), WorkerError> {
        *self.settlements.lock().unwrap() += 1;
        Ok(())
    }

    async fn reject_without_requeue(&self) -> Result<(), WorkerError> {
        *self.settlements.lock().unwrap() += 1;
        match self.role {
            ConsumerRole::Primary => self.broker.dead_letter.lock().unwrap().push_back(self.body.clone()),
            ConsumerRole::DeadLetter => self.broker.dropped.lock().unwrap().push(self.body.clone()),
        }
        Ok(())
    }
}

impl FakeBroker {
    fn publish(&self, body: &[u8]) {
        self.main.lock().unwrap().push_back(body.to_vec());
    }

    fn queue(&self, role: ConsumerRole) -> &Mutex<VecDeque<Vec<u8>>> {
        match role {
            ConsumerRole::Primary => &self.main,
            ConsumerRole::DeadLetter => &self.dead_letter,
        }
    }

    /// Delivers every queued message of `role` to the handler.
    async fn drain<S: TicketStore>(&self, role: ConsumerRole, handler: &TicketHandler<S>) -> Vec<Disposition> {
        let mut dispositions = Vec::new();
        let mut tag = 0;
        loop {
            let next = self.queue(role).lock().unwrap().pop_front();
            let Some(body) = next else { break };
            tag += 1;

            let delivery = FakeDelivery { broker: self, role, body, settlements: Mutex::new(0) };
            let disposition = process_delivery(role, tag, &delivery.body, handler, &delivery).await.unwrap();
            assert_eq!(*delivery.settlements.lock().unwrap(), 1);
            dispositions.push(disposition);
        }
        dispositions
    }
}

/// A store whose pool is gone, as during a database outage.
struct UnavailableStore;

#[async_trait]
impl TicketStore for UnavailableStore {
    async fn save(&self, _ticket: &Ticket) -> Result<i64, WorkerError> {
        Err(WorkerError::Store(sqlx::Error::PoolClosed))
    }
}

async fn store() -> Arc<SqliteTicketStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteTicketStore::from_pool(pool);
    store.migrate().await.unwrap();
    Arc::new(store)
}

async fn titles(store: &SqliteTicketStore) -> Vec<String> {
    sqlx::query_scalar("select Titulo from Chamados order by Id")
        .fetch_all(store.pool())
        .await
        .unwrap()
}

fn handlers(store: &Arc<SqliteTicketStore>) -> (TicketHandler<SqliteTicketStore>, TicketHandler<SqliteTicketStore>) {
    (
        TicketHandler::new("primary", store.clone(), ForcedFailure::default()),
        TicketHandler::new("dead-letter", store.clone(), ForcedFailure::default()),
    )
}

#[tokio::test]
async fn valid_ticket_is_stored_and_never_dead_lettered() {
    let store = store().await;
    let (primary, dead_letter) = handlers(&store);
    let broker = FakeBroker::default();

    broker.publish(SAMPLE.as_bytes());
    assert_eq!(broker.drain(ConsumerRole::Primary, &primary).await, vec![Disposition::Acked]);
    assert!(broker.drain(ConsumerRole::DeadLetter, &dead_letter).await.is_empty());

    let (id, title, maintenance, criticality, status): (i64, String, i64, i64, i64) =
        sqlx::query_as("select Id, Titulo, TipoManutencao, Criticidade, Status from Chamados")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert!(id > 0);
    assert_eq!(title, "Troca de filtro");
    assert_eq!((maintenance, criticality, status), (1, 2, 1));
}

#[tokio::test]
async fn marker_ticket_is_dead_lettered_once_then_discarded() {
    let store = store().await;
    let (primary, dead_letter) = handlers(&store);
    let broker = FakeBroker::default();

    let poison = SAMPLE.replace("Troca de filtro", "DLQ");
    broker.publish(poison.as_bytes());

    assert_eq!(broker.drain(ConsumerRole::Primary, &primary).await, vec![Disposition::Rejected]);
    assert_eq!(broker.dead_letter.lock().unwrap().len(), 1);
    assert!(titles(&store).await.is_empty());

    assert_eq!(broker.drain(ConsumerRole::DeadLetter, &dead_letter).await, vec![Disposition::Rejected]);
    assert!(broker.main.lock().unwrap().is_empty());
    assert!(broker.dead_letter.lock().unwrap().is_empty());
    assert_eq!(broker.dropped.lock().unwrap().as_slice(), &[poison.into_bytes()]);
    assert!(titles(&store).await.is_empty());
}

#[tokio::test]
async fn dead_letter_consumer_recovers_transient_failure() {
    let store = store().await;
    let broker = FakeBroker::default();

    // The primary consumer failed on a ticket the dead-letter consumer can store,
    // as after a transient store outage.
    broker.dead_letter.lock().unwrap().push_back(SAMPLE.as_bytes().to_vec());
    let (_, dead_letter) = handlers(&store);

    assert_eq!(broker.drain(ConsumerRole::DeadLetter, &dead_letter).await, vec![Disposition::Acked]);
    assert_eq!(titles(&store).await, vec!["Troca de filtro".to_string()]);
    assert!(broker.dropped.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_body_is_dead_lettered_without_store_mutation() {
    let store = store().await;
    let (primary, _) = handlers(&store);
    let broker = FakeBroker::default();

    broker.publish(b"{\"Titulo\": ");
    broker.publish(&[0xff, 0x00, 0x7b]);
    broker.publish(SAMPLE.replace(r#""Status":1"#, r#""Status":4"#).as_bytes());

    assert_eq!(
        broker.drain(ConsumerRole::Primary, &primary).await,
        vec![Disposition::Rejected, Disposition::Rejected, Disposition::Rejected]
    );
    assert_eq!(broker.dead_letter.lock().unwrap().len(), 3);
    assert!(titles(&store).await.is_empty());
}

#[tokio::test]
async fn redelivery_stores_duplicate_rows() {
    let store = store().await;
    let (primary, _) = handlers(&store);
    let broker = FakeBroker::default();

    broker.publish(SAMPLE.as_bytes());
    broker.publish(SAMPLE.as_bytes());

    assert_eq!(
        broker.drain(ConsumerRole::Primary, &primary).await,
        vec![Disposition::Acked, Disposition::Acked]
    );
    assert_eq!(titles(&store).await.len(), 2);
}

#[tokio::test]
async fn empty_description_is_stored_and_acked() {
    let store = store().await;
    let (primary, _) = handlers(&store);
    let broker = FakeBroker::default();

    broker.publish(SAMPLE.replace(r#""Descricao":"Filtro sujo""#, r#""Descricao":"""#).as_bytes());

    assert_eq!(broker.drain(ConsumerRole::Primary, &primary).await, vec![Disposition::Acked]);
    assert!(broker.dead_letter.lock().unwrap().is_empty());

    let description: String = sqlx::query_scalar("select Descricao from Chamados")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(description, "");
}

#[tokio::test]
async fn store_failure_is_dead_lettered_then_recovered() {
    let store = store().await;
    let primary = TicketHandler::new("primary", Arc::new(UnavailableStore), ForcedFailure::default());
    let (_, dead_letter) = handlers(&store);
    let broker = FakeBroker::default();

    broker.publish(SAMPLE.as_bytes());

    assert_eq!(broker.drain(ConsumerRole::Primary, &primary).await, vec![Disposition::Rejected]);
    assert_eq!(broker.dead_letter.lock().unwrap().len(), 1);
    assert!(titles(&store).await.is_empty());

    assert_eq!(broker.drain(ConsumerRole::DeadLetter, &dead_letter).await, vec![Disposition::Acked]);
    assert_eq!(titles(&store).await, vec!["Troca de filtro".to_string()]);
}

#[tokio::test]
async fn store_failure_on_dead_letter_queue_is_discarded() {
    let dead_letter = TicketHandler::new("dead-letter", Arc::new(UnavailableStore), ForcedFailure::default());
    let broker = FakeBroker::default();

    broker.dead_letter.lock().unwrap().push_back(SAMPLE.as_bytes().to_vec());

    assert_eq!(broker.drain(ConsumerRole::DeadLetter, &dead_letter).await, vec![Disposition::Rejected]);
    assert!(broker.dead_letter.lock().unwrap().is_empty());
    assert_eq!(broker.dropped.lock().unwrap().len(), 1);
}
