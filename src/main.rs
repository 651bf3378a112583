use croquet::crm::{self, CrmSettings};
use croquet::CroquetBuilder;

#[tokio::main]
async fn main() {
    // DATABASE_URL and friends may come from a .env file
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    crm::configure_builder(CroquetBuilder::<CrmSettings>::create(&args))
        .add_css("crm.css")
        .pid_file("croquet.pid")
        .build_or_die()
        .run()
        .await;
}
